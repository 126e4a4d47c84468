/// Claim tickets from anonymous joins, waiting for an account
pub const PENDING_CLAIMS: &str = "pending_claims";
