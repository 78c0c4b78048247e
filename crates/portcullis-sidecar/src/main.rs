//! Portcullis sidecar — entry point.

use std::sync::Arc;

use portcullis_authz::{EvaluatorCache, PolicyModule};
use portcullis_router::RouteTable;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portcullis_sidecar::{oas, Environment, SidecarServer};

fn print_help() {
    println!(
        r"Portcullis - authorization sidecar

USAGE:
    portcullis

OPTIONS:
    -h, --help       Print help information
    -v, --version    Print version information

ENVIRONMENT VARIABLES:
    LOG_LEVEL                   Logger verbosity (default: info)
    HTTP_PORT                   Listen port (default: 8080)
    TARGET_SERVICE_HOST         Upstream host for the proxy (required)
    TARGET_SERVICE_OAS_PATH     Path that triggers documentation passthrough
    API_PERMISSIONS_FILE_PATH   Static OpenAPI file overriding auto-fetch
    OPA_MODULES_DIRECTORY       Directory of policy source files (required)
    USER_PROPERTIES_HEADER_KEY  Header carrying JSON user properties
    USER_GROUPS_HEADER_KEY      Header carrying comma-separated groups
    CLIENT_TYPE_HEADER_KEY      Header carrying the client type
    DELAY_SHUTDOWN_SECONDS      Graceful-shutdown window (default: 10)
    STANDALONE                  Enable standalone path-prefix stripping
    PATH_PREFIX_STANDALONE      Prefix stripped in standalone mode (default: /eval)
"
    );
}

#[tokio::main]
async fn main() {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return;
            }
            "--version" | "-v" => {
                println!("portcullis {}", portcullis_sidecar::VERSION);
                return;
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    // The log level is read ahead of full configuration so that startup
    // failures are themselves logged at the requested level.
    let level = match std::env::var("LOG_LEVEL").as_deref() {
        Ok("warning") => "warn".to_string(),
        Ok(level) if !level.is_empty() => level.to_string(),
        _ => "info".to_string(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let env = match Environment::from_env() {
        Ok(env) => Arc::new(env),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let module = match PolicyModule::load_from_dir(&env.opa_modules_directory) {
        Ok(module) => Arc::new(module),
        Err(e) => {
            error!(error = %e, "failed to load policy module");
            std::process::exit(1);
        }
    };

    let spec = match oas::load_openapi_spec(&env).await {
        Ok(spec) => spec,
        Err(e) => {
            error!(error = %e, "failed to load OpenAPI document");
            std::process::exit(1);
        }
    };

    let routes = match RouteTable::from_spec(&spec) {
        Ok(routes) => Arc::new(routes),
        Err(e) => {
            error!(error = %e, "failed to build route table");
            std::process::exit(1);
        }
    };

    let evaluators = match EvaluatorCache::build(&module, routes.policy_names()) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            error!(error = %e, "failed to compile policies");
            std::process::exit(1);
        }
    };

    info!(
        version = portcullis_sidecar::VERSION,
        routes = routes.len(),
        policies = evaluators.len(),
        "starting portcullis sidecar"
    );

    let server = match SidecarServer::new(env, module, routes, evaluators) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
