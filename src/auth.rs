use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ServiceError, ServiceResult};

/// Role of the acting user within a study container.
///
/// The host application's full ACL subsystem stays outside this crate;
/// repositories and services only need enough to attribute changes and to
/// gate the administrative operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    Admin,
    Editor,
    Reader,
}

impl UserRole {
    pub fn can_manage_study(&self) -> bool {
        matches!(self, UserRole::Admin)
    }

    pub fn can_edit_data(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Editor)
    }
}

/// Authentication context passed through repository and service calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// The ID of the authenticated user
    pub user_id: Uuid,

    /// The role of the authenticated user
    pub role: UserRole,
}

impl AuthContext {
    /// Create a new authentication context
    pub fn new(user_id: Uuid, role: UserRole) -> Self {
        Self { user_id, role }
    }

    /// Context for internal maintenance operations (cache rebuilds, cascades)
    pub fn internal_system_context() -> Self {
        Self {
            user_id: Uuid::nil(),
            role: UserRole::Admin,
        }
    }

    pub fn require_study_admin(&self) -> ServiceResult<()> {
        if self.role.can_manage_study() {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(
                "study administration requires the Admin role".to_string(),
            ))
        }
    }

    pub fn require_edit(&self) -> ServiceResult<()> {
        if self.role.can_edit_data() {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(
                "data modification requires the Editor role".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_gates() {
        let admin = AuthContext::new(Uuid::new_v4(), UserRole::Admin);
        let editor = AuthContext::new(Uuid::new_v4(), UserRole::Editor);
        let reader = AuthContext::new(Uuid::new_v4(), UserRole::Reader);

        assert!(admin.require_study_admin().is_ok());
        assert!(editor.require_study_admin().is_err());
        assert!(editor.require_edit().is_ok());
        assert!(reader.require_edit().is_err());
    }
}
