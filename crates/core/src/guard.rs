//! Periodic session validation and auth-state following.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::LocalCache;
use crate::engine::SyncEngine;
use crate::notify::Notification;
use crate::remote::{AuthEvent, AuthService, RemoteStore, SessionCheck};

/// Spawns the guard. It stops after forcing a logout or when the auth event
/// stream closes.
pub fn spawn_session_guard<R, C, A>(engine: SyncEngine<R, C>, auth: Arc<A>) -> JoinHandle<()>
where
    R: RemoteStore,
    C: LocalCache,
    A: AuthService,
{
    let period = engine.config().session_check_interval;
    let mut events = auth.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the session was just checked
        // by whoever logged in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !engine.is_logged_in().await {
                        continue;
                    }
                    if let SessionCheck::Invalid { reason } = auth.validate_session().await {
                        error!(reason = %reason, "Session failed validation, forcing logout");
                        if let Err(e) = auth.logout().await {
                            warn!(error = %e, "Auth logout failed");
                        }
                        engine.logout().await;
                        engine.notifier().publish(Notification::blocking_error(format!(
                            "Your session has ended: {reason}. Please sign in again."
                        )));
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(AuthEvent::SignedOut) => {
                        info!("Signed out");
                        engine.logout().await;
                    }
                    Ok(AuthEvent::SignedIn(user)) => {
                        if let Err(e) = engine.login(user).await {
                            warn!(error = %e, "Login after sign-in event failed");
                        }
                    }
                    Ok(AuthEvent::TokenRefreshed) => debug!("Auth token refreshed"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Auth events lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Session guard stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::SyncConfig;
    use crate::error::Result;
    use crate::memory::MemoryRemote;
    use crate::models::{Role, User};
    use crate::notify::Level;

    struct FakeAuth {
        check: Mutex<SessionCheck>,
        events: broadcast::Sender<AuthEvent>,
    }

    impl FakeAuth {
        fn new(user: User) -> Self {
            Self {
                check: Mutex::new(SessionCheck::Valid(user)),
                events: broadcast::channel(8).0,
            }
        }

        fn invalidate(&self, reason: &str) {
            *self.check.lock().unwrap() = SessionCheck::Invalid {
                reason: reason.into(),
            };
        }
    }

    impl AuthService for FakeAuth {
        async fn current_user(&self) -> Result<Option<User>> {
            Ok(match &*self.check.lock().unwrap() {
                SessionCheck::Valid(user) => Some(user.clone()),
                SessionCheck::Invalid { .. } => None,
            })
        }

        async fn validate_session(&self) -> SessionCheck {
            self.check.lock().unwrap().clone()
        }

        async fn logout(&self) -> Result<()> {
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
            self.events.subscribe()
        }
    }

    fn user() -> User {
        User {
            id: "u1".into(),
            name: "Carla".into(),
            email: "carla@example.com".into(),
            tenant_id: "c1".into(),
            role: Role::Engineer,
            active: true,
            job_title: Some("Engenheira residente".into()),
        }
    }

    fn engine() -> SyncEngine<MemoryRemote, MemoryCache> {
        SyncEngine::new(
            Arc::new(MemoryRemote::new()),
            Arc::new(MemoryCache::new()),
            SyncConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_session_forces_logout_with_blocking_error() {
        let engine = engine();
        engine.login(user()).await.unwrap();
        let auth = Arc::new(FakeAuth::new(user()));
        let mut notifications = engine.notifier().subscribe();
        let guard = spawn_session_guard(engine.clone(), Arc::clone(&auth));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(engine.is_logged_in().await);

        auth.invalidate("tenant mismatch");
        tokio::time::sleep(Duration::from_secs(30)).await;
        guard.await.unwrap();

        assert!(!engine.is_logged_in().await);
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.level, Level::Error);
        assert!(notification.is_blocking());
        assert!(notification.message.contains("tenant mismatch"));
    }

    #[tokio::test(start_paused = true)]
    async fn follows_sign_in_and_sign_out_events() {
        let engine = engine();
        let auth = Arc::new(FakeAuth::new(user()));
        let _guard = spawn_session_guard(engine.clone(), Arc::clone(&auth));
        tokio::task::yield_now().await;

        auth.events.send(AuthEvent::SignedIn(user())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.current_user().await.unwrap().id, "u1");

        auth.events.send(AuthEvent::TokenRefreshed).unwrap();
        auth.events.send(AuthEvent::SignedOut).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!engine.is_logged_in().await);
    }
}
