use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub image_url: Option<String>,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public projection of a post's author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct PostAuthor {
    pub id: Uuid,
    pub name: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct PostWithAuthor {
    #[serde(flatten)]
    #[ts(flatten)]
    pub post: Post,
    pub author: PostAuthor,
}

impl std::ops::Deref for PostWithAuthor {
    type Target = Post;
    fn deref(&self) -> &Self::Target {
        &self.post
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct CreatePost {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Partial update. `image_url`: absent leaves the image alone, `null` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePost {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    #[ts(type = "string | null")]
    pub image_url: Option<Option<String>>,
}

#[derive(Debug, FromRow)]
struct PostWithAuthorRow {
    id: Uuid,
    title: String,
    content: String,
    image_url: Option<String>,
    author_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    author_name: String,
    author_image: Option<String>,
}

impl From<PostWithAuthorRow> for PostWithAuthor {
    fn from(row: PostWithAuthorRow) -> Self {
        Self {
            author: PostAuthor {
                id: row.author_id,
                name: row.author_name,
                image: row.author_image,
            },
            post: Post {
                id: row.id,
                title: row.title,
                content: row.content,
                image_url: row.image_url,
                author_id: row.author_id,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
        }
    }
}

const POST_COLUMNS: &str = "id, title, content, image_url, author_id, created_at, updated_at";

const POST_WITH_AUTHOR_SELECT: &str = r#"SELECT
    p.id         AS id,
    p.title      AS title,
    p.content    AS content,
    p.image_url  AS image_url,
    p.author_id  AS author_id,
    p.created_at AS created_at,
    p.updated_at AS updated_at,
    u.name       AS author_name,
    u.image      AS author_image
FROM posts p
JOIN users u ON u.id = p.author_id"#;

impl Post {
    pub async fn create(
        pool: &SqlitePool,
        author_id: Uuid,
        data: &CreatePost,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Post>(&format!(
            "INSERT INTO posts (id, title, content, image_url, author_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             RETURNING {POST_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&data.title)
        .bind(&data.content)
        .bind(&data.image_url)
        .bind(author_id)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Post>(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Applies the update only when `author_id` owns the post.
    pub async fn update(
        pool: &SqlitePool,
        author_id: Uuid,
        data: &UpdatePost,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Post>(&format!(
            "UPDATE posts SET
                title      = COALESCE($3, title),
                content    = COALESCE($4, content),
                image_url  = CASE WHEN $5 THEN $6 ELSE image_url END,
                updated_at = $7
             WHERE id = $1 AND author_id = $2
             RETURNING {POST_COLUMNS}"
        ))
        .bind(data.id)
        .bind(author_id)
        .bind(&data.title)
        .bind(&data.content)
        .bind(data.image_url.is_some())
        .bind(data.image_url.clone().flatten())
        .bind(Utc::now())
        .fetch_optional(pool)
        .await
    }

    /// Deletes the post only when `author_id` owns it.
    pub async fn delete(
        pool: &SqlitePool,
        id: Uuid,
        author_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Post>(&format!(
            "DELETE FROM posts WHERE id = $1 AND author_id = $2 RETURNING {POST_COLUMNS}"
        ))
        .bind(id)
        .bind(author_id)
        .fetch_optional(pool)
        .await
    }
}

impl PostWithAuthor {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let row = sqlx::query_as::<_, PostWithAuthorRow>(&format!(
            "{POST_WITH_AUTHOR_SELECT} WHERE p.id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Newest-first page of at most `take` posts. With `start`, the page begins at that
    /// post (inclusive) and continues with everything older.
    pub async fn find_page(
        pool: &SqlitePool,
        take: i64,
        start: Option<&Post>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let rows = match start {
            Some(start) => {
                sqlx::query_as::<_, PostWithAuthorRow>(&format!(
                    "{POST_WITH_AUTHOR_SELECT}
                     WHERE (p.created_at, p.id) <= ($1, $2)
                     ORDER BY p.created_at DESC, p.id DESC
                     LIMIT $3"
                ))
                .bind(start.created_at)
                .bind(start.id)
                .bind(take)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PostWithAuthorRow>(&format!(
                    "{POST_WITH_AUTHOR_SELECT}
                     ORDER BY p.created_at DESC, p.id DESC
                     LIMIT $1"
                ))
                .bind(take)
                .fetch_all(pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
