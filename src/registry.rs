//! Module registry — `(stage tag, variant tag) → stage factory`.
//!
//! Populated once at process start and read-only thereafter; the assembler
//! resolves factories by exact match and treats absence as an assembly error.
//! Factories capture the process-wide capabilities (credential manager,
//! transport) so layer configs stay pure data.

use std::{collections::HashMap, sync::Arc};

use crate::compiler::LayerConfig;
use crate::config::KNOWN_COMPAT_PROFILES;
use crate::credentials::CredentialManager;
use crate::stages::{
    CompatStage, ProtocolStage, ServerStage, StageModule, StageTag, TransformerStage, Transport,
};

pub type StageFactory = Box<dyn Fn(&LayerConfig) -> anyhow::Result<StageModule> + Send + Sync>;

pub struct ModuleRegistry {
    factories: HashMap<(StageTag, String), StageFactory>,
}

impl ModuleRegistry {
    /// The built-in module set: one transformer shape, the OpenAI protocol
    /// envelope, every known compatibility profile, and the HTTP server.
    pub fn builtin(credentials: Arc<CredentialManager>, transport: Arc<dyn Transport>) -> Self {
        let mut registry = Self { factories: HashMap::new() };

        registry.register(
            StageTag::Transformer,
            TransformerStage::DIRECTION,
            Box::new(|layer| Ok(StageModule::Transformer(TransformerStage::from_config(layer)?))),
        );

        let creds = Arc::clone(&credentials);
        registry.register(
            StageTag::Protocol,
            "openai",
            Box::new(move |layer| {
                Ok(StageModule::Protocol(ProtocolStage::from_config(layer, Arc::clone(&creds))?))
            }),
        );

        for profile in KNOWN_COMPAT_PROFILES {
            let creds = Arc::clone(&credentials);
            registry.register(
                StageTag::ServerCompatibility,
                profile,
                Box::new(move |layer| {
                    Ok(StageModule::Compat(CompatStage::from_config(layer, Arc::clone(&creds))?))
                }),
            );
        }

        let creds = Arc::clone(&credentials);
        registry.register(
            StageTag::Server,
            "http",
            Box::new(move |layer| {
                Ok(StageModule::Server(ServerStage::from_config(
                    layer,
                    Arc::clone(&creds),
                    Arc::clone(&transport),
                )?))
            }),
        );

        registry
    }

    pub fn register(&mut self, stage: StageTag, variant: &str, factory: StageFactory) {
        self.factories.insert((stage, variant.to_string()), factory);
    }

    /// Exact-match lookup; `None` means the assembler must fail the pipeline.
    pub fn get(&self, stage: StageTag, variant: &str) -> Option<&StageFactory> {
        self.factories.get(&(stage, variant.to_string()))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }
}
