//! OAuth defaults
//!
//! Public client configuration for the default upstream provider. These values
//! identify the public client application and are not secrets; deployments
//! override them through the service configuration.

/// Key under which the provider's live credential sits in the auth store
pub const DEFAULT_PROVIDER: &str = "anthropic";

/// Public OAuth client ID used for token refresh
pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Token endpoint for refresh-token grants
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Credential type tag written into the auth store
pub const CREDENTIAL_TYPE_OAUTH: &str = "oauth";

/// Safety margin subtracted from every access-token lifetime (5 minutes)
pub const DEFAULT_REFRESH_MARGIN_MS: u64 = 5 * 60 * 1000;
