use std::sync::Arc;

use db::models::post::{CreatePost, Post, PostWithAuthor, UpdatePost};
use rpc::{
    Authed, HandlerError, Procedure, RequestContext,
    api::post::{self, ListPosts, PostId, PostPage},
};

pub async fn list(ctx: Arc<RequestContext>, input: ListPosts) -> Result<PostPage, HandlerError> {
    let start = match input.cursor {
        Some(id) => Some(
            Post::find_by_id(&ctx.db.pool, id)
                .await?
                .ok_or(HandlerError::NotFound("cursor"))?,
        ),
        None => None,
    };
    let mut posts = PostWithAuthor::find_page(&ctx.db.pool, input.limit + 1, start.as_ref()).await?;
    let next_cursor = if posts.len() as i64 > input.limit {
        posts.pop().map(|extra| extra.post.id)
    } else {
        None
    };
    Ok(PostPage { posts, next_cursor })
}

pub async fn by_id(ctx: Arc<RequestContext>, input: PostId) -> Result<PostWithAuthor, HandlerError> {
    PostWithAuthor::find_by_id(&ctx.db.pool, input.id)
        .await?
        .ok_or(HandlerError::NotFound("post"))
}

pub async fn create(authed: Authed, input: CreatePost) -> Result<Post, HandlerError> {
    let post = Post::create(&authed.db.pool, authed.user_id(), &input).await?;
    tracing::info!(post_id = %post.id, author_id = %post.author_id, "Post created");
    Ok(post)
}

/// Posts owned by someone else are reported as missing.
pub async fn update(authed: Authed, input: UpdatePost) -> Result<Post, HandlerError> {
    Post::update(&authed.db.pool, authed.user_id(), &input)
        .await?
        .ok_or(HandlerError::NotFound("post"))
}

pub async fn delete(authed: Authed, input: PostId) -> Result<Post, HandlerError> {
    let post = Post::delete(&authed.db.pool, input.id, authed.user_id())
        .await?
        .ok_or(HandlerError::NotFound("post"))?;
    tracing::info!(post_id = %post.id, "Post deleted");
    Ok(post)
}

pub fn procedures() -> Vec<Procedure> {
    vec![
        Procedure::query(post::LIST, list),
        Procedure::query(post::BY_ID, by_id),
        Procedure::protected_mutation(post::CREATE, create),
        Procedure::protected_mutation(post::UPDATE, update),
        Procedure::protected_mutation(post::DELETE, delete),
    ]
}
