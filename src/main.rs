#[macro_use]
extern crate clap;

use clap::{App, ArgMatches};
use env_logger::{Builder, Env};
use hoard::{
    install::Installation,
    opener::ThunderstoreOpener,
    registry::{self, NumericResolver, PullRegistry, Resolver, ThunderstoreResolver},
    storage::{BlobStore, FileStore, MemoryStore},
    Error, Manager, OpenerRegistry,
};
use std::{fs::File, io, sync::Arc};
use tokio::{net::TcpListener, task};
use url::Url;

#[tokio::main]
async fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = global_value(&matches, "log_level").unwrap_or("warn");
    Builder::from_env(Env::default().default_filter_or(log_level)).init();

    if let Err(err) = run(&matches).await {
        log::error!("{}", err);
        eprintln!("hoard: {}", err);
        std::process::exit(1);
    }
}

async fn run(matches: &ArgMatches<'_>) -> Result<(), Error> {
    let thunderstore_url = Url::parse(
        global_value(matches, "thunderstore_url").unwrap_or(ThunderstoreOpener::DEFAULT_URL),
    )?;
    let openers = OpenerRegistry::builder()
        .register_builtin(reqwest::Client::new(), thunderstore_url)
        .build();

    match matches.subcommand() {
        ("serve", Some(sub)) => serve(openers, sub).await,
        (name, Some(sub)) => {
            let manager = manager(openers, matches)?;
            match name {
                "install" => {
                    let installation = manager
                        .install(sub.value_of("url").unwrap_or(""), sub.value_of("dir").unwrap_or(""))
                        .await?;
                    println!("{}", installation);
                }
                "uninstall" => {
                    manager
                        .uninstall(sub.value_of("url").unwrap_or(""), sub.value_of("dir").unwrap_or(""))
                        .await?
                }
                "list" => {
                    for installation in manager.installations().await? {
                        print_installation(&installation);
                    }
                }
                "extract" => extract(&manager, sub).await?,
                _ => unreachable!(),
            }
            manager.close().await
        }
        _ => unreachable!(),
    }
}

fn manager(openers: OpenerRegistry, matches: &ArgMatches<'_>) -> Result<Manager, Error> {
    let db_path = match global_value(matches, "db") {
        Some(path) => path.into(),
        None => Manager::default_db_path()?,
    };
    let mut builder = Manager::builder(openers).db_path(db_path);
    if let Some(prefix) = global_value(matches, "label_prefix") {
        builder = builder.label_prefix(prefix);
    }
    builder.build()
}

fn print_installation(installation: &Installation) {
    println!(
        "{}\t{}\t{}\t{}",
        installation.digest, installation.url, installation.dir, installation.cache_key
    );
}

async fn extract(manager: &Manager, matches: &ArgMatches<'_>) -> Result<(), Error> {
    let schemes = string_values(matches, "scheme");
    let mut stream = if schemes.is_empty() {
        manager.extract_all().await?
    } else {
        manager.extract(&schemes[..]).await?
    };
    let output = matches.value_of("output").map(str::to_owned);
    task::spawn_blocking(move || -> Result<(), Error> {
        match output {
            Some(path) => {
                io::copy(&mut stream, &mut File::create(path)?)?;
            }
            None => {
                io::copy(&mut stream, &mut io::stdout().lock())?;
            }
        }
        Ok(())
    })
    .await?
}

async fn serve(openers: OpenerRegistry, matches: &ArgMatches<'_>) -> Result<(), Error> {
    let resolver: Arc<dyn Resolver> = match matches.value_of("resolver") {
        Some("numeric") => Arc::new(NumericResolver::new(matches.value_of("scheme").unwrap_or("steamapp"))),
        _ => Arc::new(ThunderstoreResolver::new()),
    };
    let store: Arc<dyn BlobStore> = match matches.value_of("cache_dir") {
        Some(dir) => Arc::new(FileStore::new(dir)),
        None => Arc::new(MemoryStore::new()),
    };
    let registry = PullRegistry::builder(openers, resolver, store)
        .dir(matches.value_of("dir").unwrap_or(""))
        .build()?;

    let addr = matches.value_of("listen").unwrap_or("127.0.0.1:5000");
    let listener = TcpListener::bind(addr).await?;
    log::info!("serving registry on {}", listener.local_addr()?);
    axum::serve(listener, registry::router(Some(registry))).await?;
    Ok(())
}

/// Global options may come before or after the subcommand
fn global_value<'a>(matches: &'a ArgMatches<'_>, name: &str) -> Option<&'a str> {
    let sub = matches.subcommand().1;
    match sub.and_then(|sub| sub.value_of(name)) {
        Some(value) if sub.map_or(false, |sub| sub.occurrences_of(name) > 0) => Some(value),
        _ => matches.value_of(name),
    }
}

fn string_values<S: AsRef<str>>(matches: &ArgMatches, name: S) -> Vec<String> {
    match matches.values_of(name) {
        Some(strs) => strs.map(|s| s.to_string()).collect(),
        None => Vec::new(),
    }
}
