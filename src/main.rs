use actix_web::{middleware, web, App, HttpServer};
use anyhow::{Context, Result};
use spoiler_classifier::config::Settings;
use spoiler_classifier::server;
use spoiler_classifier::torch::{self, Predictor};
use std::path::PathBuf;
use std::{env, process};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: ./spoiler-classifier [config file]";

fn get_args() -> Option<PathBuf> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        println!("{USAGE}");
        process::exit(1);
    }
    args.get(1).map(PathBuf::from)
}

#[actix_web::main]
async fn main() -> Result<()> {
    let settings = Settings::load(get_args().as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log.filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // No requests are served unless the model loads
    let model = torch::load_classifier(&settings.model).context("failed to load the model")?;
    let predictor = web::Data::new(Predictor::new(model, settings.model.labels.clone()));

    let max_body_bytes = settings.server.max_body_bytes;
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(predictor.clone())
            .wrap(middleware::Logger::default())
            .wrap(server::cors())
            .configure(server::configure(max_body_bytes))
    });
    if let Some(workers) = settings.server.workers {
        server = server.workers(workers);
    }

    info!("listening on {}", settings.bind_addr());
    server.bind(settings.bind_addr())?.run().await?;
    Ok(())
}
