use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Default lifetime of a resolved admin target.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Default location of the persisted setup user.
pub const DEFAULT_SETUP_USER_PATH: &str = "/var/lib/warden/setup-user";

// Conventional admin threshold in Matrix room power levels.
const ADMIN_POWER_LEVEL: i64 = 50;
// Bound on the membership query; a slow homeserver must not stall reporting.
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(10);

/// A member of the designated admin room.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RoomMember {
    pub user_id: String,
    pub power_level: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Which tier of the fallback chain produced a recipient.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminSource {
    Config,
    Setup,
    Room,
    Fallback,
}

impl std::fmt::Display for AdminSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AdminSource::Config => "config",
            AdminSource::Setup => "setup",
            AdminSource::Room => "room",
            AdminSource::Fallback => "fallback",
        })
    }
}

/// A resolved recipient with its provenance.
#[derive(Clone, Debug, PartialEq)]
pub struct AdminTarget {
    pub mxid: String,
    pub source: AdminSource,
}

/// Capability for querying the membership of a room. Failures and empty
/// lists are treated as a miss; ordering of the returned list is preserved.
#[async_trait::async_trait]
pub trait MembershipSource: Send + Sync {
    async fn get_room_members(
        &self,
        ctx: &CancellationToken,
        room_id: &str,
    ) -> anyhow::Result<Vec<RoomMember>>;
}

struct State {
    config_admin: String,
    setup_user: String,
    admin_room: String,
    fallback: String,
    membership: Option<Arc<dyn MembershipSource>>,
    cached: Option<CacheEntry>,
}

struct CacheEntry {
    target: AdminTarget,
    expires: Instant,
}

/// Resolves the single human recipient for notifications by walking a
/// priority chain: explicit config, the setup-time user, an admin-room
/// membership query, then a last-resort fallback.
///
/// Successful resolutions are cached for the TTL; every setter invalidates
/// the cache synchronously. The state lock is never held across the
/// membership query.
pub struct AdminResolver {
    state: RwLock<State>,
    cache_ttl: Duration,
    setup_user_path: Option<PathBuf>,
}

impl AdminResolver {
    /// A TTL of zero falls back to the default.
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            state: RwLock::new(State {
                config_admin: String::new(),
                setup_user: String::new(),
                admin_room: String::new(),
                fallback: String::new(),
                membership: None,
                cached: None,
            }),
            cache_ttl: if cache_ttl.is_zero() {
                DEFAULT_CACHE_TTL
            } else {
                cache_ttl
            },
            setup_user_path: None,
        }
    }

    /// Persist the setup user at `path` (mode 0600), and load any
    /// previously persisted identifier now.
    pub fn with_setup_user_path(mut self, path: PathBuf) -> Self {
        if let Ok(raw) = std::fs::read_to_string(&path) {
            let mxid = raw.trim();
            if !mxid.is_empty() {
                self.state.get_mut().unwrap().setup_user = mxid.to_string();
            }
        }
        self.setup_user_path = Some(path);
        self
    }

    pub fn set_config_admin(&self, mxid: &str) {
        let mut state = self.state.write().unwrap();
        state.config_admin = mxid.to_string();
        state.cached = None;
    }

    pub fn set_setup_user(&self, mxid: &str) {
        {
            let mut state = self.state.write().unwrap();
            state.setup_user = mxid.to_string();
            state.cached = None;
        }
        self.persist_setup_user(mxid);
    }

    pub fn set_admin_room(&self, room_id: &str) {
        let mut state = self.state.write().unwrap();
        state.admin_room = room_id.to_string();
        state.cached = None;
    }

    pub fn set_fallback(&self, mxid: &str) {
        let mut state = self.state.write().unwrap();
        state.fallback = mxid.to_string();
        state.cached = None;
    }

    pub fn set_membership_source(&self, source: Arc<dyn MembershipSource>) {
        let mut state = self.state.write().unwrap();
        state.membership = Some(source);
        state.cached = None;
    }

    /// Drop any cached target without touching configuration.
    pub fn invalidate_cache(&self) {
        self.state.write().unwrap().cached = None;
    }

    /// Resolve the current admin target, consulting the cache first.
    pub async fn resolve(&self, ctx: &CancellationToken) -> crate::Result<AdminTarget> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(target) = self.cached_target(&self.state.read().unwrap()) {
            return Ok(target);
        }

        // Read-miss: double-check under the write lock (another resolve may
        // have just repopulated it), then snapshot the tiers. The lock is
        // dropped before the membership query runs.
        let (config_admin, setup_user, admin_room, fallback, membership) = {
            let state = self.state.write().unwrap();
            if let Some(target) = self.cached_target(&state) {
                return Ok(target);
            }
            (
                state.config_admin.clone(),
                state.setup_user.clone(),
                state.admin_room.clone(),
                state.fallback.clone(),
                state.membership.clone(),
            )
        };

        let target = if !config_admin.is_empty() {
            AdminTarget {
                mxid: config_admin,
                source: AdminSource::Config,
            }
        } else if !setup_user.is_empty() {
            AdminTarget {
                mxid: setup_user,
                source: AdminSource::Setup,
            }
        } else if let Some(mxid) = self.query_room(ctx, &admin_room, membership).await {
            AdminTarget {
                mxid,
                source: AdminSource::Room,
            }
        } else if !fallback.is_empty() {
            AdminTarget {
                mxid: fallback,
                source: AdminSource::Fallback,
            }
        } else {
            return Err(Error::NoAdminResolved);
        };

        let mut state = self.state.write().unwrap();
        state.cached = Some(CacheEntry {
            target: target.clone(),
            expires: Instant::now() + self.cache_ttl,
        });
        Ok(target)
    }

    fn cached_target(&self, state: &State) -> Option<AdminTarget> {
        state
            .cached
            .as_ref()
            .filter(|entry| entry.expires > Instant::now())
            .map(|entry| entry.target.clone())
    }

    // Query the admin room, bounded by the timeout and the caller's token.
    // Any failure, timeout, or empty list is a miss and the chain continues.
    async fn query_room(
        &self,
        ctx: &CancellationToken,
        room_id: &str,
        membership: Option<Arc<dyn MembershipSource>>,
    ) -> Option<String> {
        if room_id.is_empty() {
            return None;
        }
        let source = membership?;

        let members = tokio::select! {
            _ = ctx.cancelled() => {
                tracing::debug!(room_id, "membership query cancelled");
                return None;
            }
            fetched = tokio::time::timeout(MEMBERSHIP_TIMEOUT, source.get_room_members(ctx, room_id)) => {
                match fetched {
                    Err(_) => {
                        tracing::debug!(room_id, "membership query timed out");
                        return None;
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(room_id, error = %err, "membership query failed");
                        return None;
                    }
                    Ok(Ok(members)) => members,
                }
            }
        };

        if members.is_empty() {
            return None;
        }
        let admin = members
            .iter()
            .find(|member| member.power_level >= ADMIN_POWER_LEVEL)
            .unwrap_or(&members[0]);
        Some(admin.user_id.clone())
    }

    fn persist_setup_user(&self, mxid: &str) {
        let Some(path) = &self.setup_user_path else {
            return;
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(dir);
            }
        }
        if let Err(err) = std::fs::write(path, mxid) {
            tracing::warn!(path = %path.display(), error = %err, "persisting setup user");
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) =
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(path = %path.display(), error = %err, "restricting setup user file");
            }
        }
    }
}
