//! Role based authorization rules.

use crate::schema::UserRole;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    ManageUsers,
    ManageWorkspaces,
    ManageWebhooks,
    ReadJobs,
    ReadDataset,
    ManageDataset,
    ManageRecords,
    ManageSuggestions,
    /// Create a response as oneself.
    CreateResponse,
    /// Update or delete an existing response; `own` is true when the actor wrote it.
    ModifyResponse { own: bool },
}

/// `is_member` is whether the actor belongs to the workspace that owns the
/// resource; it is ignored for workspace-less actions.
pub fn is_allowed(role: UserRole, is_member: bool, action: Action) -> bool {
    if role == UserRole::Owner {
        return true;
    }

    match action {
        Action::ManageUsers | Action::ManageWorkspaces | Action::ManageWebhooks | Action::ReadJobs => false,
        Action::ReadDataset | Action::CreateResponse => is_member,
        Action::ManageDataset | Action::ManageRecords | Action::ManageSuggestions => {
            role == UserRole::Admin && is_member
        }
        Action::ModifyResponse { own } => is_member && (own || role == UserRole::Admin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_can_do_everything() {
        for action in [
            Action::ManageUsers,
            Action::ManageWebhooks,
            Action::ReadJobs,
            Action::ManageDataset,
            Action::ModifyResponse { own: false },
        ] {
            assert!(is_allowed(UserRole::Owner, false, action));
        }
    }

    #[test]
    fn admin_is_scoped_to_workspaces() {
        assert!(is_allowed(UserRole::Admin, true, Action::ManageDataset));
        assert!(!is_allowed(UserRole::Admin, false, Action::ManageDataset));
        assert!(is_allowed(UserRole::Admin, true, Action::ModifyResponse { own: false }));
        assert!(!is_allowed(UserRole::Admin, true, Action::ManageWebhooks));
    }

    #[test]
    fn jobs_are_owner_only() {
        assert!(is_allowed(UserRole::Owner, false, Action::ReadJobs));
        assert!(!is_allowed(UserRole::Admin, true, Action::ReadJobs));
        assert!(!is_allowed(UserRole::Admin, false, Action::ReadJobs));
    }

    #[test]
    fn annotator_only_touches_own_responses() {
        assert!(is_allowed(UserRole::Annotator, true, Action::ReadDataset));
        assert!(is_allowed(UserRole::Annotator, true, Action::CreateResponse));
        assert!(is_allowed(UserRole::Annotator, true, Action::ModifyResponse { own: true }));
        assert!(!is_allowed(UserRole::Annotator, true, Action::ModifyResponse { own: false }));
        assert!(!is_allowed(UserRole::Annotator, true, Action::ManageRecords));
        assert!(!is_allowed(UserRole::Annotator, false, Action::ReadDataset));
        assert!(!is_allowed(UserRole::Annotator, true, Action::ReadJobs));
    }
}
