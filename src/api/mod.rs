// =============================================================================
// API Module — REST surface and authentication
// =============================================================================

pub mod auth;
pub mod rest;
