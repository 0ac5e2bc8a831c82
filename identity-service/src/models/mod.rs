pub mod domain_event;
pub mod organization;
pub mod refresh_token;
pub mod role;
pub mod user;

pub use domain_event::{DomainEvent, DomainEventType};
pub use organization::{OrgMembership, Organization, OrganizationChanges};
pub use refresh_token::{RefreshFamily, RefreshToken, RefreshTokenState};
pub use role::{Role, RoleChanges, UserRole, ADMIN_ROLE, DEFAULT_ROLES};
pub use user::{normalize_email, ExternalIdentity, IdentProvider, User};
