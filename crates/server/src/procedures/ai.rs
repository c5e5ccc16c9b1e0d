use rpc::{
    Authed, HandlerError, Procedure,
    api::ai::{self, SummarizeInput, Summary},
};
use services::services::ai::{AiClient, AiError};

pub fn procedures(client: AiClient) -> Vec<Procedure> {
    vec![Procedure::protected_mutation(
        ai::SUMMARIZE,
        move |_authed: Authed, input: SummarizeInput| {
            let client = client.clone();
            async move { summarize(&client, &input.text).await }
        },
    )]
}

async fn summarize(client: &AiClient, text: &str) -> Result<Summary, HandlerError> {
    match client.summarize(text).await {
        Ok(summary) => Ok(Summary { summary }),
        Err(AiError::NotConfigured) => Err(HandlerError::BadRequest(
            "AI summarization is not available".to_string(),
        )),
        Err(e) => Err(HandlerError::Upstream(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use rpc::{HandlerCode, RpcError};

    use super::*;

    #[tokio::test]
    async fn unconfigured_client_is_a_bad_request() {
        let client = AiClient::new(None, None).unwrap();
        let err = summarize(&client, "text").await.unwrap_err().into_rpc("ai.summarize");
        assert_eq!(
            err,
            RpcError::Handler {
                code: HandlerCode::BadRequest,
                message: "AI summarization is not available".into(),
            }
        );
    }

    #[tokio::test]
    async fn upstream_failures_are_masked() {
        let client = AiClient::new(Some("sk-test".to_string().into()), None)
            .unwrap()
            .with_endpoint("http://127.0.0.1:9/v1/messages");
        let err = summarize(&client, "text").await.unwrap_err().into_rpc("ai.summarize");
        assert_eq!(
            err,
            RpcError::Handler {
                code: HandlerCode::Upstream,
                message: "upstream service unavailable".into(),
            }
        );
    }
}
