//! This module implements the command line part of the application.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use ics_core::{
    calendar_client,
    chrono::Utc,
    reqwest::Client,
    time_zone::ZoneResolver,
};

use crate::{config::AppConfig, route::next_event::NextEventResponse};

/// Serve the next upcoming event of iCalendar feeds.
#[derive(Debug, Parser)]
#[command()]
pub struct Arguments {
    #[command(subcommand)]
    pub command: Option<Command>,
    /// app server port, overrides the configuration
    #[arg(short, long)]
    pub port: Option<u16>,
    /// debug mode
    #[arg(short, long)]
    pub debug: bool,
    /// the configuration file
    #[arg(short, long, default_value = "config.yml")]
    pub config: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// print the next event of a calendar as JSON
    Next {
        #[command(flatten)]
        args: NextArgs,
    },
}

#[derive(Debug, Args)]
pub struct NextArgs {
    /// the URL of the iCalendar feed
    pub ics_url: String,
    /// the time zone for floating times and all-day events
    #[arg(long, default_value = "")]
    pub tz: String,
}

pub async fn run(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::Next { args: next_args } => run_next(next_args, config).await?,
    };
    Ok(())
}

async fn run_next(next_args: NextArgs, config: &AppConfig) -> Result<()> {
    let next_event = calendar_client::get_next_event(
        &Client::new(),
        &next_args.ics_url,
        &next_args.tz,
        config.lookahead(),
        &ZoneResolver::new(&config.time_zone_aliases),
        Utc::now(),
    )
    .await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&NextEventResponse::from(next_event))?
    );
    Ok(())
}
