pub mod database;
pub mod error;
pub mod events;
pub mod identity;
pub mod jwt;
pub mod memory;
pub mod metrics;
pub mod oauth;
pub mod rbac;
pub mod redis;
pub mod seed;
pub mod session;
pub mod store;
pub mod tokens;

pub use database::Database;
pub use error::ServiceError;
pub use events::{EventBus, EventPublisher, InMemoryBus};
pub use identity::{IdentityResolver, ResolvedUser};
pub use jwt::{AccessTokenClaims, JwtService};
pub use memory::MemoryStore;
pub use oauth::{
    CredentialVerifier, GoogleIdentityProvider, IdentityProvider, LoginRedirect,
    MemoryStateStore, MockIdentityProvider, OAuthStateStore,
};
pub use rbac::{Decision, RbacAuthorizer};
pub use redis::RedisService;
pub use seed::seed_default_roles;
pub use session::{
    Actor, AssignmentOutcome, Backends, LoginResult, RefreshResult, SessionFacade,
    SessionSettings,
};
pub use store::{
    AccessStore, EventOutbox, HealthCheck, RefreshTokenStore, RoleDeletion, UserStore,
};
pub use tokens::{RotationOutcome, TokenPair, TokenService};
