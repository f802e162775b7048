use genforge_core::UserId;
use genforge_generation::PlanTier;

/// Authenticated caller for a request.
///
/// Inserted by the auth middleware; every job and credits route reads it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: UserId,
    plan: PlanTier,
}

impl UserContext {
    pub fn new(user_id: UserId, plan: PlanTier) -> Self {
        Self { user_id, plan }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn plan(&self) -> PlanTier {
        self.plan
    }
}
