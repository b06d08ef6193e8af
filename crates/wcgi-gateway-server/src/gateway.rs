//! Gateway orchestration.
//!
//! [`Gateway::handle`] routes one request end to end: resolve the script's
//! fingerprint, reset its lifecycle entry, eagerly release superseded
//! resources, compile (or reuse) the module, then dispatch through either
//! the classic CGI bridge or the persistent tunnel.
//!
//! The three caches here are the only shared mutable state in the system:
//! compiled modules and tunnel sessions live in compute-once caches, and
//! every script owns one [`InstanceRegistry`] entry whose idle timer and
//! cancellation scope govern both.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{Request, Response};
use tracing::{debug, instrument};

use wcgi_gateway_common::{CacheConfig, GatewayError};
use wcgi_gateway_core::cache::ComputeCache;
use wcgi_gateway_core::engine::{CompiledScript, ScriptCapability, ScriptEngine};
use wcgi_gateway_core::fingerprint::{ModuleKey, SessionKey};
use wcgi_gateway_core::lifecycle::InstanceRegistry;

use crate::cgi;
use crate::context::RequestContext;
use crate::env::build_cgi_env;
use crate::tunnel::{self, TunnelSession};

/// Handler for internal redirects.
///
/// When a script's response carries a `Location` header starting with `/`,
/// the gateway dispatches a synthesized GET to this delegate instead of
/// returning the CGI response to the client. Without a delegate configured,
/// local redirects pass through as ordinary 302 responses.
#[async_trait]
pub trait RedirectDelegate: Send + Sync {
    /// Handle a synthesized internal request.
    async fn dispatch(&self, req: Request<Body>) -> Response<Body>;
}

/// A compiled module held by the module cache.
pub struct ModuleEntry {
    /// The fingerprint this module was built from.
    pub key: ModuleKey,
    /// The compiled module itself.
    pub script: Arc<dyn CompiledScript>,
}

/// The gateway core: lifecycle caches wired to both protocol bridges.
pub struct Gateway {
    engine: Arc<dyn ScriptEngine>,
    modules: Arc<ComputeCache<ModuleKey, ModuleEntry>>,
    sessions: Arc<ComputeCache<SessionKey, TunnelSession>>,
    instances: InstanceRegistry,
    redirect: Option<Arc<dyn RedirectDelegate>>,
}

impl Gateway {
    /// Create a gateway over the given execution engine.
    pub fn new(engine: Arc<dyn ScriptEngine>, cache: &CacheConfig) -> Self {
        Self {
            engine,
            modules: Arc::new(ComputeCache::new()),
            sessions: Arc::new(ComputeCache::new()),
            instances: InstanceRegistry::new(cache.idle_timeout()),
            redirect: None,
        }
    }

    /// Configure the internal-redirect delegate.
    #[must_use]
    pub fn with_redirect(mut self, delegate: Arc<dyn RedirectDelegate>) -> Self {
        self.redirect = Some(delegate);
        self
    }

    /// Number of compiled modules currently cached.
    pub fn cached_modules(&self) -> usize {
        self.modules.len()
    }

    /// Number of tunnel sessions currently cached.
    pub fn cached_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Number of live instance entries.
    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    /// Tear down every instance entry, closing all sessions.
    pub fn shut_down(&self) {
        self.instances.shut_down_all();
    }

    /// Route one request through the gateway.
    #[instrument(skip(self, ctx, req), fields(script = %ctx.script_path.display()))]
    pub async fn handle(
        &self,
        ctx: RequestContext,
        req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        let script_display = ctx.script_path.display().to_string();
        let metadata = match tokio::fs::metadata(&ctx.script_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GatewayError::script_not_found(script_display));
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            return Err(GatewayError::ScriptIsDirectory {
                path: script_display,
            });
        }
        let modified = metadata.modified()?;

        let module_key = ModuleKey::new(&ctx.script_path, modified);
        let session_key = SessionKey::new(
            module_key.clone(),
            ctx.debug,
            ctx.workdir.clone(),
            ctx.net_rule.clone(),
        );

        let entry =
            self.instances
                .get_or_create(&ctx.script_path, module_key.clone(), session_key.clone());

        // Swap in the current fingerprints and release whatever they
        // superseded, before anything is built under the new keys. Two live
        // sessions for one script must never coexist.
        let stale = entry.rebind(module_key.clone(), session_key.clone());
        if let Some(old) = stale.module {
            if self.modules.remove(&old).is_some() {
                debug!(key = %old, "released superseded module");
            }
        }
        if let Some(old) = stale.session {
            if let Some(session) = self.sessions.remove(&old) {
                session.close();
                debug!(key = %old, "closed superseded session");
            }
        }

        let module = {
            let engine = self.engine.clone();
            let path = ctx.script_path.clone();
            let key = module_key.clone();
            self.modules
                .get_or_try_init(&module_key, || async move {
                    let bytes = tokio::fs::read(&path).await?;
                    let script = engine.compile(bytes).await?;
                    Ok::<_, GatewayError>(Arc::new(ModuleEntry { key, script }))
                })
                .await?
        };

        if ctx.force_classic || module.script.capability() == ScriptCapability::ClassicOnly {
            let modules = self.modules.clone();
            let evicted = module.clone();
            let key = module_key.clone();
            let failure_hook = move || {
                if modules.remove_if_value(&key, &evicted) {
                    debug!(key = %key, "evicted module after execution failure");
                }
            };
            return cgi::execute(
                module.script.clone(),
                &ctx,
                req,
                self.redirect.clone(),
                failure_hook,
            )
            .await;
        }

        let env = build_cgi_env(&ctx, req.method(), req.uri(), req.headers());

        let session = {
            let script = module.script.clone();
            let key = session_key.clone();
            let sessions = self.sessions.clone();
            let close_key = session_key.clone();
            let on_close = move || {
                if let Some(current) = sessions.get(&close_key) {
                    if current.is_closed() {
                        sessions.remove_if_value(&close_key, &current);
                    }
                }
            };
            let ctx_ref = &ctx;
            let scope = entry.scope();
            self.sessions
                .get_or_try_init(&session_key, || async move {
                    tunnel::establish(script, ctx_ref, env, key, scope, on_close).await
                })
                .await?
        };

        match session.proxy(req).await {
            Ok(response) => Ok(response),
            Err(error) => {
                // A dead session comes out of the cache so the next request
                // re-creates one.
                if session.is_closed() {
                    self.sessions.remove_if_value(&session_key, &session);
                }
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("cached_modules", &self.cached_modules())
            .field("cached_sessions", &self.cached_sessions())
            .field("live_instances", &self.live_instances())
            .finish_non_exhaustive()
    }
}
