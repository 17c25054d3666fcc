use anyhow::{Result, bail};
use rand::Rng;
use rand::distributions::Alphanumeric;

/// Length of the random token appended to instance names.
const NAME_TOKEN_LEN: usize = 8;

/// Validate a runner or pool name: lowercase alphanumeric + hyphens,
/// 1-63 chars, no leading or trailing hyphen.
pub fn validate_id(id: &str, kind: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 {
        bail!("{} name must be 1-63 characters, got {}", kind, id.len());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "{} name must be lowercase alphanumeric + hyphens: {:?}",
            kind,
            id
        );
    }
    if id.starts_with('-') || id.ends_with('-') {
        bail!("{} name must not start or end with a hyphen: {:?}", kind, id);
    }
    Ok(())
}

/// Generate an instance name: `{runner}-{pool}-{token}`.
///
/// The token is 8 chars drawn uniformly from the 62-symbol alphanumeric
/// alphabet. Names are informational only; instance identity is the
/// provider-assigned id.
pub fn instance_name(runner: &str, pool: &str) -> String {
    format!("{}-{}-{}", runner, pool, random_token())
}

/// Placeholder key for an instance whose provider create call is still
/// in flight. Replaced by the provider id once the call returns.
pub fn reservation_id() -> String {
    format!("pending-{}", random_token())
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(NAME_TOKEN_LEN)
        .map(char::from)
        .collect()
}
