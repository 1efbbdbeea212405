//! # One-Shot Scrape Runner
//!
//! Loads a scrape definition file, runs a single fetch cycle for every
//! resource and prints what each sensor extracted. Useful for checking
//! selectors against a live page before handing the file to the daemon.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use lib_scrape::configs::ScrapeFile;
use lib_scrape::core::Coordinator;
use lib_scrape::retrieve::HttpFetcher;

/// Command line of the runner.
#[derive(Parser, Debug)]
#[clap(about = "Fetch every resource once and print the extracted values")]
struct Args {
    /// Scrape definition file (JSON or YAML).
    #[clap(long)]
    scrape_path: PathBuf,

    /// Print the full JSON snapshot instead of one line per sensor.
    #[clap(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let file = ScrapeFile::load(&args.scrape_path)?.validate()?;

    println!("--- {} resource(s) in {} ---", file.scrape.len(), args.scrape_path.display());

    for resource in file.scrape {
        println!("\n[{}]", resource.display_name());
        let fetcher = Arc::new(HttpFetcher::new(&resource)?);
        let mut coordinator = Coordinator::new(resource, fetcher)?;
        let handle = coordinator.handle();

        if let Err(e) = coordinator.first_refresh().await {
            println!("❌ fetch failed: {}", e);
            continue;
        }

        let snapshot = handle.snapshot();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&*snapshot)?);
            continue;
        }
        for sensor in &snapshot.sensors {
            match &sensor.native_value {
                Some(value) => println!("✅ {} = {:?}", sensor.name, value),
                None => println!("⚠️  {} = <no value>", sensor.name),
            }
        }
    }

    Ok(())
}
