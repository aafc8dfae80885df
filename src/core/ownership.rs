use nix::unistd::{Gid, Uid, User};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The human on whose behalf the process runs, even under `sudo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokingUser {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
}

impl From<User> for InvokingUser {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
            home: user.dir,
        }
    }
}

/// Resolve the invoking user.
///
/// Detection order:
/// 1. `SUDO_USER` - the user who ran `sudo bkmirror`
/// 2. the real uid of this process
pub fn invoking_user() -> Option<InvokingUser> {
    if let Some(user) = user_from_sudo() {
        debug!(user = %user.name, "Detected invoking user from SUDO_USER");
        return Some(user);
    }

    match User::from_uid(Uid::current()) {
        Ok(Some(user)) => Some(user.into()),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Failed to look up current user");
            None
        }
    }
}

fn user_from_sudo() -> Option<InvokingUser> {
    let sudo_user = std::env::var("SUDO_USER").ok()?;
    if sudo_user.is_empty() || sudo_user == "root" {
        return None;
    }
    let user = User::from_name(&sudo_user).ok()??;
    Some(user.into())
}

/// Home directory used for home backups and home restores.
///
/// An explicit override wins; then the `SUDO_USER` account's home; then
/// `$HOME`; then the password database entry of the current uid.
pub fn resolve_home(override_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = override_dir {
        return Some(dir.to_path_buf());
    }
    if let Some(user) = user_from_sudo() {
        return Some(user.home);
    }
    if let Some(home) = std::env::var_os("HOME").filter(|h| !h.is_empty()) {
        return Some(PathBuf::from(home));
    }
    invoking_user().map(|u| u.home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins() {
        let home = resolve_home(Some(Path::new("/srv/alt-home")));
        assert_eq!(home, Some(PathBuf::from("/srv/alt-home")));
    }

    #[test]
    fn current_user_resolves() {
        // Every test environment has a passwd entry for its own uid.
        let user = invoking_user();
        assert!(user.is_some());
    }

    #[test]
    fn some_home_is_found() {
        assert!(resolve_home(None).is_some());
    }
}
