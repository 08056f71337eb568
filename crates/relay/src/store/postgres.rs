use std::collections::HashMap;

use chrono::{DateTime, Utc};
use easel_common::types::{Canvas, CanvasSummary, UserRef};
use serde_json::Value;
use sqlx::{types::Json, PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{StoreError, UserRecord};

#[derive(sqlx::FromRow)]
struct CanvasRow {
    pk: i64,
    external_id: Uuid,
    name: String,
    owner_id: Uuid,
    owner_email: String,
    elements: Json<Vec<Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ShareRow {
    canvas_pk: i64,
    user_id: Uuid,
    email: String,
}

impl CanvasRow {
    fn into_canvas(self, shared: Vec<UserRef>) -> Canvas {
        Canvas {
            id: self.external_id,
            name: self.name,
            owner: UserRef { id: self.owner_id, email: self.owner_email },
            shared,
            elements: self.elements.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

const CANVAS_COLUMNS: &str = r#"
    c.id AS pk,
    c.external_id,
    c.name,
    c.owner_id,
    u.email AS owner_email,
    c.elements,
    c.created_at,
    c.updated_at
"#;

pub(super) async fn find_user_by_email(
    pool: &PgPool,
    email: &str,
) -> Result<Option<UserRecord>, StoreError> {
    sqlx::query_as::<_, UserRecord>(
        r#"
        SELECT id, name, email, password_hash, created_at, updated_at
        FROM users
        WHERE email = $1
        "#,
    )
    .bind(email)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)
}

pub(super) async fn create_user(
    pool: &PgPool,
    name: &str,
    email: &str,
    password_hash: &str,
) -> Result<UserRecord, StoreError> {
    sqlx::query_as::<_, UserRecord>(
        r#"
        INSERT INTO users (id, name, email, password_hash)
        VALUES ($1, $2, $3, $4)
        RETURNING id, name, email, password_hash, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(email)
    .bind(password_hash)
    .fetch_one(pool)
    .await
    .map_err(map_sqlx_error)
}

pub(super) async fn find_canvas(
    pool: &PgPool,
    canvas_id: Uuid,
) -> Result<Option<Canvas>, StoreError> {
    let mut tx = read_snapshot(pool).await?;
    let row = sqlx::query_as::<_, CanvasRow>(&format!(
        r#"
        SELECT {CANVAS_COLUMNS}
        FROM canvases AS c
        INNER JOIN users AS u ON u.id = c.owner_id
        WHERE c.external_id = $1
        "#
    ))
    .bind(canvas_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let shared = shares_for(&mut tx, &[row.pk]).await?.remove(&row.pk).unwrap_or_default();
    tx.commit().await.map_err(map_sqlx_error)?;
    Ok(Some(row.into_canvas(shared)))
}

pub(super) async fn create_canvas(
    pool: &PgPool,
    owner: &UserRef,
    name: &str,
) -> Result<Canvas, StoreError> {
    let (created_at, updated_at, external_id) =
        sqlx::query_as::<_, (DateTime<Utc>, DateTime<Utc>, Uuid)>(
            r#"
            INSERT INTO canvases (external_id, name, owner_id)
            VALUES ($1, $2, $3)
            RETURNING created_at, updated_at, external_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(owner.id)
        .fetch_one(pool)
        .await
        .map_err(map_sqlx_error)?;

    Ok(Canvas {
        id: external_id,
        name: name.to_owned(),
        owner: owner.clone(),
        shared: Vec::new(),
        elements: Vec::new(),
        created_at,
        updated_at,
    })
}

pub(super) async fn list_canvases_for_user(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<CanvasSummary>, StoreError> {
    let mut tx = read_snapshot(pool).await?;
    let rows = sqlx::query_as::<_, CanvasRow>(&format!(
        r#"
        SELECT {CANVAS_COLUMNS}
        FROM canvases AS c
        INNER JOIN users AS u ON u.id = c.owner_id
        WHERE c.owner_id = $1
           OR EXISTS (
                SELECT 1 FROM canvas_shares AS s
                WHERE s.canvas_pk = c.id AND s.user_id = $1
           )
        ORDER BY c.created_at DESC, c.id DESC
        "#
    ))
    .bind(user_id)
    .fetch_all(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    let pks: Vec<i64> = rows.iter().map(|row| row.pk).collect();
    let mut shares = shares_for(&mut tx, &pks).await?;
    tx.commit().await.map_err(map_sqlx_error)?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let shared = shares.remove(&row.pk).unwrap_or_default();
            row.into_canvas(shared).summary()
        })
        .collect())
}

pub(super) async fn replace_elements(
    pool: &PgPool,
    canvas_id: Uuid,
    elements: Vec<Value>,
) -> Result<Canvas, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE canvases
        SET elements = $2, updated_at = now()
        WHERE external_id = $1
        "#,
    )
    .bind(canvas_id)
    .bind(Json(elements))
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound("canvas"));
    }

    require_canvas(pool, canvas_id).await
}

pub(super) async fn add_shared_user(
    pool: &PgPool,
    canvas_id: Uuid,
    user_id: Uuid,
) -> Result<Canvas, StoreError> {
    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO canvas_shares (canvas_pk, user_id)
        SELECT c.id, $2 FROM canvases AS c WHERE c.external_id = $1
        ON CONFLICT (canvas_pk, user_id) DO NOTHING
        "#,
    )
    .bind(canvas_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    if inserted.rows_affected() > 0 {
        touch_canvas(&mut tx, canvas_id).await?;
    }
    tx.commit().await.map_err(map_sqlx_error)?;

    require_canvas(pool, canvas_id).await
}

pub(super) async fn remove_shared_user(
    pool: &PgPool,
    canvas_id: Uuid,
    user_id: Uuid,
) -> Result<Canvas, StoreError> {
    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

    let removed = sqlx::query(
        r#"
        DELETE FROM canvas_shares AS s
        USING canvases AS c
        WHERE s.canvas_pk = c.id
          AND c.external_id = $1
          AND s.user_id = $2
        "#,
    )
    .bind(canvas_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    if removed.rows_affected() > 0 {
        touch_canvas(&mut tx, canvas_id).await?;
    }
    tx.commit().await.map_err(map_sqlx_error)?;

    require_canvas(pool, canvas_id).await
}

pub(super) async fn delete_canvas(pool: &PgPool, canvas_id: Uuid) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM canvases WHERE external_id = $1")
        .bind(canvas_id)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound("canvas"));
    }

    Ok(())
}

async fn require_canvas(pool: &PgPool, canvas_id: Uuid) -> Result<Canvas, StoreError> {
    find_canvas(pool, canvas_id).await?.ok_or(StoreError::NotFound("canvas"))
}

/// Read-only transaction whose statements all see one snapshot, so a canvas
/// row and its share list always agree.
async fn read_snapshot(pool: &PgPool) -> Result<Transaction<'static, Postgres>, StoreError> {
    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
    Ok(tx)
}

async fn touch_canvas(
    tx: &mut Transaction<'_, Postgres>,
    canvas_id: Uuid,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE canvases SET updated_at = now() WHERE external_id = $1")
        .bind(canvas_id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

    Ok(())
}

async fn shares_for(
    conn: &mut PgConnection,
    canvas_pks: &[i64],
) -> Result<HashMap<i64, Vec<UserRef>>, StoreError> {
    if canvas_pks.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, ShareRow>(
        r#"
        SELECT s.canvas_pk, u.id AS user_id, u.email
        FROM canvas_shares AS s
        INNER JOIN users AS u ON u.id = s.user_id
        WHERE s.canvas_pk = ANY($1)
        ORDER BY s.added_at ASC, u.email ASC
        "#,
    )
    .bind(canvas_pks)
    .fetch_all(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    let mut grouped: HashMap<i64, Vec<UserRef>> = HashMap::new();
    for row in rows {
        grouped.entry(row.canvas_pk).or_default().push(UserRef { id: row.user_id, email: row.email });
    }

    Ok(grouped)
}

fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(database_error) = &error {
        if database_error.code().as_deref() == Some("23505") {
            return StoreError::Conflict("user already exists");
        }
    }

    StoreError::Backend(error.into())
}
