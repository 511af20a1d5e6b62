use crate::commands::{build_backends, load_context};
use crate::output::Output;
use anyhow::Result;
use clap::Subcommand;
use rand::Rng;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum SystemCommands {
    /// Show the API key, generating one when none is configured
    Apikey,
    /// Check database and backend reachability
    Healthcheck,
}

pub async fn run(cmd: SystemCommands, config_dir: Option<PathBuf>, output: &Output) -> Result<u8> {
    let ctx = match load_context(config_dir).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };

    match cmd {
        SystemCommands::Apikey => {
            match &ctx.config.api_key {
                Some(key) => output.line(key),
                None => {
                    let key: String = {
                        let mut rng = rand::thread_rng();
                        (0..32).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
                    };
                    output.line(format!("no api key configured; generated one: {key}"));
                    output.line("set WS_API_KEY or add it to the configuration to persist it");
                }
            }
            Ok(crate::EXIT_OK)
        }
        SystemCommands::Healthcheck => {
            let mut healthy = true;

            let states = ctx.store.count().await?;
            output.line(format!("store: ok ({states} states)"));

            let backends = build_backends(&ctx.config, &[])?;
            for (config, adapter) in &backends {
                match adapter.identifier(true).await {
                    Ok(id) => {
                        let version = adapter.version().await.unwrap_or_default();
                        output.line(format!("{}: ok (id={id}, version={version})", config.name));
                    }
                    Err(e) => {
                        healthy = false;
                        output.line(format!("{}: FAILED ({e})", config.name));
                    }
                }
            }

            Ok(if healthy { crate::EXIT_OK } else { crate::EXIT_BACKEND })
        }
    }
}
