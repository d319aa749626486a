// src/bot/mod.rs - Assembles the dispatcher and the feature processors into one bot

use anyhow::Result;
use log::info;
use std::sync::Arc;

use crate::config::{ConfigManager, Subscription};
use crate::llm::LlmClient;
use crate::platforms::PlatformClient;
use crate::types::Event;

pub mod ban_registry;
pub mod conversation;
pub mod dispatcher;
pub mod moderation;
pub mod processor;
pub mod queue;
pub mod random;
pub mod rate_limit;
pub mod scheduler;
pub mod scripted;

use ban_registry::BanRegistry;
use conversation::{ConversationFeature, PersonaAssigner};
use dispatcher::{DispatchReport, Dispatcher};
use moderation::ModerationFeature;
use processor::FeatureProcessor;
use random::RandomSource;
use scheduler::DelayedTasks;
use scripted::ScriptedFeature;

/// The running assistant: one dispatcher feeding the scripted,
/// conversation and moderation processors.
pub struct ChatBot {
    dispatcher: Dispatcher,
    processors: Vec<Arc<FeatureProcessor>>,
    registry: Arc<BanRegistry>,
    personas: Arc<PersonaAssigner>,
    subscription: Option<Subscription>,
}

impl ChatBot {
    pub fn new(
        config: &Arc<ConfigManager>,
        platform: Arc<dyn PlatformClient>,
        llm: Arc<dyn LlmClient>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self> {
        let snapshot = config.get_config();
        let registry = Arc::new(BanRegistry::load(snapshot.ban_registry_path()));
        let personas = Arc::new(PersonaAssigner::new());
        info!("Building chat bot for the {} platform", platform.platform_name());

        let scripted = ScriptedFeature::new(platform.clone(), random.clone());
        let conversation = ConversationFeature::new(platform.clone(), llm, random.clone(), personas.clone());
        let moderation = ModerationFeature::new(platform, random, registry.clone(), Arc::new(DelayedTasks::new()))?;

        let processors: Vec<Arc<FeatureProcessor>> = vec![
            Arc::new(FeatureProcessor::new(Box::new(scripted), snapshot.clone())),
            Arc::new(FeatureProcessor::new(Box::new(conversation), snapshot.clone())),
            Arc::new(FeatureProcessor::new(Box::new(moderation), snapshot)),
        ];

        let mut dispatcher = Dispatcher::new();
        for processor in &processors {
            dispatcher.register(processor.clone());
        }

        let targets = processors.clone();
        let subscription = config.subscribe(move |snapshot| {
            for processor in &targets {
                processor.apply_config(snapshot.clone());
            }
        });

        Ok(Self {
            dispatcher,
            processors,
            registry,
            personas,
            subscription: Some(subscription),
        })
    }

    pub fn start(&self) {
        for processor in &self.processors {
            processor.start();
        }
        info!("Chat bot started with {} features", self.processors.len());
    }

    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        self.dispatcher.dispatch(event)
    }

    /// Connected flag per feature
    pub fn health_check(&self) -> Vec<(&'static str, bool)> {
        self.processors
            .iter()
            .map(|p| (p.name(), p.is_connected()))
            .collect()
    }

    pub fn ban_registry(&self) -> &Arc<BanRegistry> {
        &self.registry
    }

    pub fn personas(&self) -> &Arc<PersonaAssigner> {
        &self.personas
    }

    /// Stop every feature and wait for their loops to finish
    pub async fn shutdown(&mut self) {
        info!("Shutting down chat bot...");
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        for processor in &self.processors {
            processor.stop();
        }
        for processor in &self.processors {
            processor.join().await;
        }
        info!("Chat bot shutdown complete");
    }
}
