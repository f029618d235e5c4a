use std::net::SocketAddr;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tracing::*;

pub use app_operator::{self, controllers, telemetry, State};

#[derive(Debug, clap::Parser)]
#[command(version, about = "Reconciles App resources into replicas")]
struct Arguments {
    /// Number of Apps reconciled in parallel
    #[arg(
        long = "concurrency",
        env = "APP_OPERATOR_CONCURRENCY",
        default_value_t = app_operator::runtime::controller::DEFAULT_CONCURRENCY
    )]
    concurrency: usize,

    /// Only watch Apps in this namespace; all namespaces if unset
    #[arg(long = "namespace", env = "WATCH_NAMESPACE", value_name = "NAMESPACE")]
    namespace: Option<String>,

    #[arg(
        long = "metrics-bind-address",
        env = "METRICS_BIND_ADDRESS",
        default_value = "0.0.0.0:8080"
    )]
    metrics_bind_address: SocketAddr,

    #[arg(long = "leader-election-namespace", default_value = "default")]
    leader_election_namespace: String,

    #[arg(long = "leader-election-id", default_value = "ada94d48.aloys.tech")]
    leader_election_id: String,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(err) = encoder.encode(&metrics, &mut buffer) {
        error!("Failed to encode metrics: {err}");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok().body(buffer)
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init()?;

    let args: Arguments = Arguments::parse();

    // Initialize Kubernetes controller state
    let state = State::default();
    let client = kube::Client::try_default().await?;
    let settings = controllers::app::Settings {
        concurrency: args.concurrency,
        namespace: args.namespace,
        leader_election_namespace: args.leader_election_namespace,
        leader_election_id: args.leader_election_id,
    };
    let controller_state = state.clone();

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .service(index)
            .service(metrics)
    })
    .bind(args.metrics_bind_address)?
    .shutdown_timeout(5)
    .run();

    // the web server has nothing left to report once the controller stopped
    let server_handle = server.handle();
    let controller = async move {
        let result = controllers::app::run(client, controller_state, settings).await;
        server_handle.stop(true).await;
        result
    };
    tokio::pin!(controller);
    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    let (controller, server) = tokio::join!(controller, server);
    controller?;
    server?;
    Ok(())
}
