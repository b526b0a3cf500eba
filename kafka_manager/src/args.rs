//! Command-line argument types for kafka-manager
//!
//! Flags mirror the JSON config keys. A `--config` file supplies the base
//! configuration and every flag given on the command line overrides it.

use crate::config::InputConfig;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for a produce run
#[derive(Parser, Debug)]
#[command(name = "kafka-manager")]
#[command(about = "Validate a producer config, connect to Kafka and produce messages")]
pub struct Args {
    /// JSON producer config file (camelCase keys, e.g. "clientId")
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Client id reported to the brokers (generated when absent)
    #[arg(long, env = "KAFKA_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Bootstrap broker address "host:port"; repeat or comma-separate for several
    #[arg(short, long = "broker", env = "KAFKA_BROKERS", value_delimiter = ',')]
    pub brokers: Vec<String>,

    /// Topic to produce to
    #[arg(short, long, env = "KAFKA_TOPIC")]
    pub topic: Option<String>,

    /// Let the broker create the topic on first use
    #[arg(long)]
    pub allow_auto_topic_creation: Option<bool>,

    /// Connection and metadata retries during init
    #[arg(long)]
    pub admin_retries: Option<u32>,

    /// Skip the health check between init and produce
    #[arg(long, default_value = "false")]
    pub skip_health: bool,

    /// Also produce every line read from standard input
    #[arg(long, default_value = "false")]
    pub stdin: bool,

    /// Quiet mode: only log errors
    #[arg(short, long, default_value = "false")]
    pub quiet: bool,

    /// Messages to produce, one record each
    pub messages: Vec<String>,
}

impl Args {
    /// Builds the producer config from `--config` and the override flags
    pub fn to_input_config(&self) -> Result<InputConfig> {
        let mut config = match &self.config {
            Some(path) => InputConfig::from_file(path)?,
            None => InputConfig::default(),
        };

        if let Some(client_id) = &self.client_id {
            config.client_id = client_id.clone();
        }
        if !self.brokers.is_empty() {
            config.brokers = self.brokers.clone();
        }
        if let Some(topic) = &self.topic {
            config.topic = topic.clone();
        }
        if self.allow_auto_topic_creation.is_some() {
            config.allow_auto_topic_creation = self.allow_auto_topic_creation;
        }
        if self.admin_retries.is_some() {
            config.admin_retries = self.admin_retries;
        }

        if self.config.is_none() && self.client_id.is_none() {
            config.client_id = format!("kafka-manager-{}", uuid::Uuid::new_v4());
        }
        Ok(config)
    }
}
