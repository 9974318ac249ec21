use thiserror::Error;

#[derive(Debug, Error)]
#[error("identity: {0}")]
pub struct IdentityError(pub String);

/// Supplies the local user name the tunnel authenticates as.
pub trait IdentitySource: Send + Sync {
    fn username(&self) -> Result<String, IdentityError>;
}

/// The account the process runs as, looked up in the user database by uid.
/// Falls back to `USER`, `LOGNAME` or `USERNAME` when there is no entry or no
/// such database.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsIdentity;

const USER_VARS: [&str; 3] = ["USER", "LOGNAME", "USERNAME"];

impl IdentitySource for OsIdentity {
    fn username(&self) -> Result<String, IdentityError> {
        resolve(passwd_name(), |k| std::env::var(k).ok())
    }
}

#[cfg(unix)]
fn passwd_name() -> Option<String> {
    use nix::unistd::{Uid, User};

    match User::from_uid(Uid::current()) {
        Ok(Some(user)) => Some(user.name),
        Ok(None) => None,
        Err(err) => {
            tracing::debug!(err = %err, "identity: user lookup failed");
            None
        }
    }
}

#[cfg(not(unix))]
fn passwd_name() -> Option<String> {
    None
}

fn resolve(
    passwd: Option<String>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<String, IdentityError> {
    passwd
        .into_iter()
        .chain(USER_VARS.iter().filter_map(|k| env(k)))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .ok_or_else(|| {
            IdentityError(format!("no user database entry and none of {USER_VARS:?} is set"))
        })
}

/// Fixed user name, from config or tests.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub String);

impl IdentitySource for StaticIdentity {
    fn username(&self) -> Result<String, IdentityError> {
        let name = self.0.trim();
        if name.is_empty() {
            return Err(IdentityError("empty user name".into()));
        }
        Ok(name.to_string())
    }
}
