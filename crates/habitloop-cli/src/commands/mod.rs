pub mod audit;
pub mod check;
pub mod habit;

use uuid::Uuid;

/// Default single-user account for a local database. Multi-account setups
/// pass `--account` explicitly.
pub fn parse_account(raw: &Option<String>) -> Result<Uuid, Box<dyn std::error::Error>> {
    match raw {
        Some(s) => Ok(Uuid::parse_str(s)?),
        None => Ok(Uuid::nil()),
    }
}
