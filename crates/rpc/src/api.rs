//! Procedure names and wire types shared by the server and its clients.

pub mod post {
    use db::models::post::{CreatePost, Post, PostWithAuthor, UpdatePost};
    use serde::{Deserialize, Serialize};
    use ts_rs::TS;
    use uuid::Uuid;

    use crate::{
        error::FieldIssue,
        procedure::{MutationDescriptor, QueryDescriptor},
        validate::{Issues, Validate},
    };

    pub const TITLE_MAX: usize = 200;
    pub const LIST_LIMIT_MAX: i64 = 100;

    pub const LIST: QueryDescriptor<ListPosts, PostPage> = QueryDescriptor::new("post.list");
    pub const BY_ID: QueryDescriptor<PostId, PostWithAuthor> = QueryDescriptor::new("post.byId");
    pub const CREATE: MutationDescriptor<CreatePost, Post> =
        MutationDescriptor::new("post.create", &["post.list"]);
    pub const UPDATE: MutationDescriptor<UpdatePost, Post> =
        MutationDescriptor::new("post.update", &["post.list", "post.byId"]);
    pub const DELETE: MutationDescriptor<PostId, Post> =
        MutationDescriptor::new("post.delete", &["post.list", "post.byId"]);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
    pub struct ListPosts {
        #[serde(default = "default_limit")]
        pub limit: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub cursor: Option<Uuid>,
    }

    fn default_limit() -> i64 {
        10
    }

    impl Default for ListPosts {
        fn default() -> Self {
            Self {
                limit: default_limit(),
                cursor: None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
    pub struct PostId {
        pub id: Uuid,
    }

    /// One page of posts, newest first. `next_cursor` is the first post of the next page.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
    #[serde(rename_all = "camelCase")]
    pub struct PostPage {
        pub posts: Vec<PostWithAuthor>,
        pub next_cursor: Option<Uuid>,
    }

    impl Validate for ListPosts {
        fn validate(&self) -> Result<(), Vec<FieldIssue>> {
            let mut issues = Issues::new();
            issues.range("limit", self.limit, 1, LIST_LIMIT_MAX);
            issues.finish()
        }
    }

    impl Validate for PostId {
        fn validate(&self) -> Result<(), Vec<FieldIssue>> {
            Ok(())
        }
    }

    impl Validate for CreatePost {
        fn validate(&self) -> Result<(), Vec<FieldIssue>> {
            let mut issues = Issues::new();
            issues
                .length("title", &self.title, 1, Some(TITLE_MAX))
                .length("content", &self.content, 1, None);
            if let Some(url) = &self.image_url {
                issues.url("imageUrl", url);
            }
            issues.finish()
        }
    }

    impl Validate for UpdatePost {
        fn validate(&self) -> Result<(), Vec<FieldIssue>> {
            let mut issues = Issues::new();
            if let Some(title) = &self.title {
                issues.length("title", title, 1, Some(TITLE_MAX));
            }
            if let Some(content) = &self.content {
                issues.length("content", content, 1, None);
            }
            if let Some(Some(url)) = &self.image_url {
                issues.url("imageUrl", url);
            }
            issues.finish()
        }
    }
}

pub mod ai {
    use serde::{Deserialize, Serialize};
    use ts_rs::TS;

    use crate::{
        error::FieldIssue,
        procedure::MutationDescriptor,
        validate::{Issues, Validate},
    };

    pub const TEXT_MAX: usize = 10_000;

    pub const SUMMARIZE: MutationDescriptor<SummarizeInput, Summary> =
        MutationDescriptor::new("ai.summarize", &[]);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
    pub struct SummarizeInput {
        pub text: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
    pub struct Summary {
        pub summary: String,
    }

    impl Validate for SummarizeInput {
        fn validate(&self) -> Result<(), Vec<FieldIssue>> {
            let mut issues = Issues::new();
            issues.length("text", &self.text, 1, Some(TEXT_MAX));
            issues.finish()
        }
    }
}

/// Bodies of the email-and-password routes under `/api/auth`.
pub mod auth {
    use serde::{Deserialize, Serialize};
    use ts_rs::TS;
    use utils::password::{MAX_PASSWORD_LEN, MIN_PASSWORD_LEN};

    use crate::{
        error::FieldIssue,
        validate::{Issues, Validate},
    };

    pub const NAME_MIN: usize = 2;

    #[derive(Debug, Clone, Serialize, Deserialize, TS)]
    pub struct SignUp {
        pub name: String,
        pub email: String,
        pub password: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, TS)]
    pub struct SignIn {
        pub email: String,
        pub password: String,
    }

    impl Validate for SignUp {
        fn validate(&self) -> Result<(), Vec<FieldIssue>> {
            let mut issues = Issues::new();
            issues
                .length("name", self.name.trim(), NAME_MIN, None)
                .email("email", self.email.trim())
                .length("password", &self.password, MIN_PASSWORD_LEN, Some(MAX_PASSWORD_LEN));
            issues.finish()
        }
    }

    impl Validate for SignIn {
        fn validate(&self) -> Result<(), Vec<FieldIssue>> {
            let mut issues = Issues::new();
            issues
                .email("email", self.email.trim())
                .length("password", &self.password, MIN_PASSWORD_LEN, Some(MAX_PASSWORD_LEN));
            issues.finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use db::models::post::{CreatePost, UpdatePost};
    use serde_json::json;

    use super::{
        ai::SummarizeInput,
        auth::{SignIn, SignUp},
        post::*,
    };
    use crate::validate::Validate;

    #[test]
    fn list_input_defaults_and_bounds() {
        let input: ListPosts = serde_json::from_value(json!({})).unwrap();
        assert_eq!(input, ListPosts::default());
        assert!(input.validate().is_ok());

        let too_many = ListPosts {
            limit: 101,
            cursor: None,
        };
        assert_eq!(too_many.validate().unwrap_err()[0].path, "limit");
        assert!(ListPosts { limit: 0, cursor: None }.validate().is_err());
    }

    #[test]
    fn list_key_matches_the_default_input_key() {
        let key = LIST.key(&ListPosts::default()).unwrap();
        assert_eq!(key.hash(), r#"["post.list",{"limit":10}]"#);
    }

    #[test]
    fn create_post_rules() {
        let empty_title = CreatePost {
            title: String::new(),
            content: "body".into(),
            image_url: None,
        };
        let issues = empty_title.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "title");

        let bad_image = CreatePost {
            title: "t".repeat(TITLE_MAX),
            content: "body".into(),
            image_url: Some("not a url".into()),
        };
        assert_eq!(bad_image.validate().unwrap_err()[0].path, "imageUrl");

        let ok = CreatePost {
            title: "Hello".into(),
            content: "World".into(),
            image_url: Some("https://example.com/cat.png".into()),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn update_only_checks_present_fields() {
        let clear_image = UpdatePost {
            image_url: Some(None),
            ..Default::default()
        };
        assert!(clear_image.validate().is_ok());

        let blank = UpdatePost {
            content: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(blank.validate().unwrap_err()[0].path, "content");
    }

    #[test]
    fn summarize_text_is_bounded() {
        let long = SummarizeInput {
            text: "a".repeat(10_001),
        };
        assert!(long.validate().is_err());
        assert!(SummarizeInput { text: "short".into() }.validate().is_ok());
    }

    #[test]
    fn sign_up_reports_every_bad_field() {
        let input = SignUp {
            name: " A ".into(),
            email: "not-an-email".into(),
            password: "short".into(),
        };
        let issues = input.validate().unwrap_err();
        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, ["name", "email", "password"]);
        assert_eq!(issues[2].message, "must be at least 8 characters");

        let sign_in = SignIn {
            email: "ada@example.com".into(),
            password: "p".repeat(129),
        };
        assert_eq!(sign_in.validate().unwrap_err()[0].path, "password");
    }
}
