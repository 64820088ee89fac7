//! In-memory implementations of the provisioning ports.
//!
//! [`InMemoryExternalServiceStore`] backs the one-shot binary and tests.
//! [`InMemoryCodeHost`] is a scriptable fake code host, available to other
//! crates' tests through the `test-support` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::{ExternalService, ExternalServiceId, ExternalServiceStore, StoreError};

// ---------------------------------------------------------------------------
// External-service store
// ---------------------------------------------------------------------------

/// A [`ExternalServiceStore`] holding rows in a map.
#[derive(Debug, Default)]
pub struct InMemoryExternalServiceStore {
    services: Mutex<HashMap<ExternalServiceId, ExternalService>>,
    unavailable: AtomicBool,
}

impl InMemoryExternalServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a row, as if the service was deleted after a job was enqueued.
    pub fn delete(&self, id: ExternalServiceId) -> Option<ExternalService> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// While set, every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExternalServiceStore for InMemoryExternalServiceStore {
    async fn get(&self, id: ExternalServiceId) -> Result<ExternalService, StoreError> {
        self.check_available()?;
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn upsert(&self, service: ExternalService) -> Result<ExternalService, StoreError> {
        self.check_available()?;
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.id, service.clone());
        Ok(service)
    }
}

// ---------------------------------------------------------------------------
// Fake code host
// ---------------------------------------------------------------------------

#[cfg(any(test, feature = "test-support"))]
pub use fake::{CodeHostOperation, InMemoryCodeHost, InMemoryCodeHostFactory};

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use std::collections::{BTreeSet, HashMap, VecDeque};
    use std::sync::{Arc, Mutex, PoisonError};

    use async_trait::async_trait;
    use tokio::sync::Barrier;

    use crate::{
        CodeHostClient, CodeHostClientFactory, ExternalServiceConfig, ExternalServiceId,
        ExternalServiceKind, Job, NewWebhook, ProvisionError, RemoteWebhook, RemoteWebhookId,
        Secret, WebhookScope, WebhookUpdate,
    };

    /// Which fake code-host call a scripted failure applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum CodeHostOperation {
        List,
        Create,
        Update,
    }

    #[derive(Default)]
    struct HostState {
        hooks: HashMap<WebhookScope, Vec<(RemoteWebhook, Secret)>>,
        next_id: u64,
        failures: HashMap<CodeHostOperation, VecDeque<ProvisionError>>,
        mutations: usize,
        calls: Vec<CodeHostOperation>,
    }

    /// A code host that keeps webhooks in memory.
    ///
    /// Creating a webhook whose target URL already exists in the scope fails
    /// with [`ProvisionError::AlreadyExists`], as real hosts do.
    pub struct InMemoryCodeHost {
        kind: ExternalServiceKind,
        org_level: bool,
        state: Mutex<HostState>,
        list_barrier: Mutex<Option<Arc<Barrier>>>,
    }

    impl InMemoryCodeHost {
        /// A host with organization-level webhooks.
        pub fn new(kind: ExternalServiceKind) -> Self {
            Self {
                kind,
                org_level: true,
                state: Mutex::new(HostState::default()),
                list_barrier: Mutex::new(None),
            }
        }

        /// A host that only supports repository-level webhooks.
        pub fn repository_level(kind: ExternalServiceKind) -> Self {
            Self {
                org_level: false,
                ..Self::new(kind)
            }
        }

        /// Makes the next call of `operation` fail with `error`.
        pub fn fail_next(&self, operation: CodeHostOperation, error: ProvisionError) {
            self.lock()
                .failures
                .entry(operation)
                .or_default()
                .push_back(error);
        }

        /// Makes every `list_webhooks` call wait on `barrier` after reading,
        /// forcing concurrent jobs to interleave check and create.
        pub fn set_list_barrier(&self, barrier: Arc<Barrier>) {
            *self
                .list_barrier
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(barrier);
        }

        /// Registers a webhook directly, bypassing the API.
        pub fn seed(&self, scope: WebhookScope, target_url: &str, active: bool) -> RemoteWebhookId {
            let mut state = self.lock();
            let id = next_id(&mut state);
            let hook = RemoteWebhook {
                id: id.clone(),
                target_url: target_url.to_owned(),
                events: BTreeSet::from(["push".to_owned()]),
                active,
                secret_configured: true,
            };
            state
                .hooks
                .entry(scope)
                .or_default()
                .push((hook, Secret::new("seeded")));
            id
        }

        pub fn webhooks(&self, scope: &WebhookScope) -> Vec<RemoteWebhook> {
            self.lock()
                .hooks
                .get(scope)
                .map(|hooks| hooks.iter().map(|(h, _)| h.clone()).collect())
                .unwrap_or_default()
        }

        /// The secret a webhook was created with.
        pub fn secret_of(&self, scope: &WebhookScope, id: &RemoteWebhookId) -> Option<Secret> {
            self.lock().hooks.get(scope).and_then(|hooks| {
                hooks
                    .iter()
                    .find(|(h, _)| &h.id == id)
                    .map(|(_, s)| s.clone())
            })
        }

        /// Number of successful create/update calls.
        pub fn mutations(&self) -> usize {
            self.lock().mutations
        }

        /// Every call received, in order, including failed ones.
        pub fn calls(&self) -> Vec<CodeHostOperation> {
            self.lock().calls.clone()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn begin(&self, operation: CodeHostOperation) -> Result<(), ProvisionError> {
            let mut state = self.lock();
            state.calls.push(operation);
            match state
                .failures
                .get_mut(&operation)
                .and_then(VecDeque::pop_front)
            {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn next_id(state: &mut HostState) -> RemoteWebhookId {
        state.next_id += 1;
        RemoteWebhookId::new(state.next_id.to_string()).unwrap_or_else(|| unreachable!())
    }

    #[async_trait]
    impl CodeHostClient for InMemoryCodeHost {
        fn kind(&self) -> ExternalServiceKind {
            self.kind
        }

        fn scope_for(&self, job: &Job) -> WebhookScope {
            if self.org_level {
                WebhookScope::Organization(job.org().to_string())
            } else {
                let repo = job.repo_name();
                WebhookScope::Repository(
                    repo.path_after_host().unwrap_or(repo.as_str()).to_owned(),
                )
            }
        }

        async fn list_webhooks(
            &self,
            scope: &WebhookScope,
        ) -> Result<Vec<RemoteWebhook>, ProvisionError> {
            self.begin(CodeHostOperation::List)?;
            let hooks = self.webhooks(scope);
            let barrier = self
                .list_barrier
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(barrier) = barrier {
                barrier.wait().await;
            }
            Ok(hooks)
        }

        async fn create_webhook(
            &self,
            scope: &WebhookScope,
            webhook: &NewWebhook,
        ) -> Result<RemoteWebhook, ProvisionError> {
            self.begin(CodeHostOperation::Create)?;
            let mut state = self.lock();
            let exists = state.hooks.get(scope).is_some_and(|hooks| {
                hooks
                    .iter()
                    .any(|(h, _)| h.target_url == webhook.target_url)
            });
            if exists {
                return Err(ProvisionError::AlreadyExists {
                    message: format!("Hook already exists on {scope}"),
                });
            }
            let id = next_id(&mut state);
            let hook = RemoteWebhook {
                id,
                target_url: webhook.target_url.clone(),
                events: webhook
                    .events
                    .iter()
                    .map(|e| format!("{e:?}").to_lowercase())
                    .collect(),
                active: true,
                secret_configured: !webhook.secret.is_empty(),
            };
            state
                .hooks
                .entry(scope.clone())
                .or_default()
                .push((hook.clone(), webhook.secret.clone()));
            state.mutations += 1;
            Ok(hook)
        }

        async fn update_webhook(
            &self,
            scope: &WebhookScope,
            id: &RemoteWebhookId,
            update: &WebhookUpdate,
        ) -> Result<RemoteWebhook, ProvisionError> {
            self.begin(CodeHostOperation::Update)?;
            let mut state = self.lock();
            let hook = state
                .hooks
                .get_mut(scope)
                .and_then(|hooks| hooks.iter_mut().find(|(h, _)| &h.id == id))
                .map(|(h, _)| {
                    h.active = update.active;
                    h.clone()
                })
                .ok_or_else(|| ProvisionError::Rejected {
                    status: 404,
                    message: format!("hook {id} not found"),
                })?;
            state.mutations += 1;
            Ok(hook)
        }
    }

    /// Hands out the same shared [`InMemoryCodeHost`] for every connection.
    pub struct InMemoryCodeHostFactory {
        host: Arc<InMemoryCodeHost>,
    }

    impl InMemoryCodeHostFactory {
        pub fn new(host: Arc<InMemoryCodeHost>) -> Self {
            Self { host }
        }
    }

    impl CodeHostClientFactory for InMemoryCodeHostFactory {
        fn kind(&self) -> ExternalServiceKind {
            self.host.kind
        }

        fn client(
            &self,
            _id: ExternalServiceId,
            _config: &ExternalServiceConfig,
        ) -> Result<Arc<dyn CodeHostClient>, ProvisionError> {
            Ok(self.host.clone())
        }
    }
}
