use std::{process, sync::Arc};

use clap::Parser;
use libris_sync::{
    AppError, LibraryContext,
    application::{
        preferences::{PreferenceStore, Theme},
        recommendations::FeedContext,
        session::Session,
    },
    cache::CacheConfig,
    config::{self, CliArgs, Command, FavoritesCommand, FeedCommand, PrefsCommand, Settings},
    infra::{gateway::memory::MemoryGateway, telemetry},
};
use serde::Serialize;
use serde_json::json;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        eprintln!("{}", error.presentation_message());
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let cli = CliArgs::parse();
    let settings = config::load(&cli)?;
    telemetry::init(&settings.logging)?;

    let context = if cli.offline {
        offline_context(&settings).await?
    } else {
        LibraryContext::from_settings(&settings).await?
    };
    let watcher = context.watch_session();
    info!(offline = cli.offline, "Context ready");

    let outcome = dispatch(&context, cli.command).await;
    watcher.abort();
    outcome
}

async fn offline_context(settings: &Settings) -> Result<LibraryContext, AppError> {
    let session = Arc::new(Session::with_token("offline"));
    let gateway = MemoryGateway::demo().with_session(session.clone());
    let preferences = PreferenceStore::load(settings.preferences.path.clone()).await?;
    Ok(LibraryContext::new(
        Arc::new(gateway),
        session,
        CacheConfig::from(&settings.cache),
        preferences,
    ))
}

async fn dispatch(context: &LibraryContext, command: Command) -> Result<(), AppError> {
    match command {
        Command::Books(args) => {
            let categories = context.queries().categories().await?;
            let (query, url) = {
                let mut filters = context.filters();
                filters.navigate(&args.url, &categories);
                (filters.active_query(), filters.to_url(&categories))
            };
            let page = context.queries().books(&query).await?;
            print_json(&json!({ "url": url, "page": page }))
        }
        Command::Book { id } => print_json(&context.queries().book(id).await?),
        Command::Favorites { command } => favorites(context, command).await,
        Command::Feed { command } => feed(context, command).await,
        Command::Prefs { command } => prefs(context, command).await,
    }
}

async fn favorites(context: &LibraryContext, command: FavoritesCommand) -> Result<(), AppError> {
    match command {
        FavoritesCommand::List => print_json(&context.queries().favorites().await?),
        FavoritesCommand::Toggle { id } => {
            let favorite = context.mutations().toggle_favorite(id).await?;
            print_json(&json!({ "id": id, "favorite": favorite }))
        }
        FavoritesCommand::Clear => {
            let report = context.mutations().clear_favorites().await?;
            let failed: Vec<_> = report
                .failed
                .iter()
                .map(|(id, error)| json!({ "id": id, "error": error.to_string() }))
                .collect();
            print_json(&json!({ "removed": report.removed, "failed": failed }))
        }
    }
}

async fn feed(context: &LibraryContext, command: FeedCommand) -> Result<(), AppError> {
    let recommendations = context.recommendations();
    match command {
        FeedCommand::Home => print_json(&recommendations.home().await),
        FeedCommand::Discover { limit } => print_json(&recommendations.user_based(limit).await?),
        FeedCommand::Similar { id, limit } => {
            print_json(&recommendations.feed(FeedContext::viewing(id, limit)).await?)
        }
        FeedCommand::Stats => print_json(&recommendations.stats().await?),
    }
}

async fn prefs(context: &LibraryContext, command: PrefsCommand) -> Result<(), AppError> {
    let preferences = context.preferences();
    let current = match command {
        PrefsCommand::Show => preferences.get(),
        PrefsCommand::Theme { theme } => preferences.set_theme(theme.parse::<Theme>()?).await?,
        PrefsCommand::PageSize { size } => preferences.set_page_size(size).await?,
    };
    print_json(&current)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
