//! Dispatch from [`ExternalServiceKind`] to the [`CodeHostClientFactory`]
//! that knows how to talk to that kind of code host.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    CodeHostClient, CodeHostClientFactory, ExternalServiceConfig, ExternalServiceId,
    ExternalServiceKind, ProvisionError,
};

/// Kinds without a registered factory cannot have webhooks provisioned.
#[derive(Default, Clone)]
pub struct CodeHostRegistry {
    factories: HashMap<ExternalServiceKind, Arc<dyn CodeHostClientFactory>>,
}

impl CodeHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under its own kind, replacing any previous one.
    pub fn register(&mut self, factory: Arc<dyn CodeHostClientFactory>) -> &mut Self {
        self.factories.insert(factory.kind(), factory);
        self
    }

    pub fn supports(&self, kind: ExternalServiceKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Builds a client for `config`, or fails with
    /// [`ProvisionError::NotSupported`] if no factory handles its kind.
    pub fn client_for(
        &self,
        id: ExternalServiceId,
        config: &ExternalServiceConfig,
    ) -> Result<Arc<dyn CodeHostClient>, ProvisionError> {
        let factory =
            self.factories
                .get(&config.kind)
                .ok_or_else(|| ProvisionError::NotSupported {
                    kind: config.kind,
                    reason: "no webhook-capable client is registered for this kind".into(),
                })?;
        factory.client(id, config)
    }
}

impl std::fmt::Debug for CodeHostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("CodeHostRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}
