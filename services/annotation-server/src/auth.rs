//! API key authentication.
//!
//! Every protected route goes through [`require_api_key`], which resolves the
//! `X-Argilla-Api-Key` header to a user and stores a [`CurrentUser`] in the
//! request extensions.

use annotations::{is_allowed, Action, UserRole};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;

pub const API_KEY_HEADER: &str = "X-Argilla-Api-Key";

#[derive(Clone, Debug)]
pub struct CurrentUser {
    pub id: Uuid,
    pub username: String,
    pub role: UserRole,
    pub workspaces: Vec<Uuid>,
}

impl CurrentUser {
    pub fn is_member(&self, workspace_id: Uuid) -> bool {
        self.workspaces.contains(&workspace_id)
    }

    pub fn can(&self, action: Action, workspace_id: Option<Uuid>) -> bool {
        let member = workspace_id.map(|w| self.is_member(w)).unwrap_or(false);
        is_allowed(self.role, member, action)
    }

    pub fn authorize(&self, action: Action, workspace_id: Option<Uuid>) -> ApiResult<()> {
        if self.can(action, workspace_id) {
            Ok(())
        } else {
            debug!(user_id=%self.id, ?action, "authorization denied");
            Err(ApiError::forbidden())
        }
    }
}

#[derive(sqlx::FromRow)]
struct AuthRow {
    id: Uuid,
    username: String,
    role: String,
    workspaces: Vec<Uuid>,
}

pub async fn find_by_api_key(pool: &PgPool, api_key: &str) -> ApiResult<Option<CurrentUser>> {
    let row: Option<AuthRow> = sqlx::query_as(
        r#"
        SELECT u.id, u.username, u.role,
               COALESCE(ARRAY_AGG(wu.workspace_id) FILTER (WHERE wu.workspace_id IS NOT NULL), '{}') AS workspaces
        FROM users u
        LEFT JOIN workspaces_users wu ON wu.user_id = u.id
        WHERE u.api_key = $1
        GROUP BY u.id
        "#,
    )
    .bind(api_key)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        let role: UserRole = r
            .role
            .parse()
            .map_err(|e| ApiError::Other(anyhow::anyhow!("corrupt user row: {e}")))?;
        Ok(CurrentUser {
            id: r.id,
            username: r.username,
            role,
            workspaces: r.workspaces,
        })
    })
    .transpose()
}

pub async fn require_api_key(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {API_KEY_HEADER} header")))?
        .to_string();

    let user = find_by_api_key(&state.pg_pool, &api_key)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid API key".to_string()))?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

pub fn generate_api_key() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: UserRole, workspaces: Vec<Uuid>) -> CurrentUser {
        CurrentUser {
            id: Uuid::new_v4(),
            username: "u".into(),
            role,
            workspaces,
        }
    }

    #[test]
    fn membership_scopes_admins() {
        let ws = Uuid::new_v4();
        let admin = user(UserRole::Admin, vec![ws]);
        assert!(admin.authorize(Action::ManageDataset, Some(ws)).is_ok());
        assert!(admin.authorize(Action::ManageDataset, Some(Uuid::new_v4())).is_err());
        assert!(admin.authorize(Action::ManageUsers, None).is_err());

        let owner = user(UserRole::Owner, vec![]);
        assert!(owner.authorize(Action::ManageDataset, Some(ws)).is_ok());
    }

    #[test]
    fn api_keys_are_random_and_url_safe() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
