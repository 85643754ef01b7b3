use std::io::Write;

use actix_web::{HttpResponse, HttpServer, get, post, web};
use serde_json::json;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay_state::RelayState;

#[get("/health")]
pub async fn health(_: web::Data<RelayState>) -> HttpResponse {
    HttpResponse::Ok().body("Ok")
}

#[get("/v1/models")]
pub async fn models(app_state: web::Data<RelayState>) -> HttpResponse {
    let data: Vec<serde_json::Value> = app_state
        .public_models()
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "chat-relay"}))
        .collect();
    HttpResponse::Ok().json(json!({"object": "list", "data": data}))
}

#[post("/v1/chat/completions")]
pub async fn chat_completions(
    body: web::Bytes,
    app_state: web::Data<RelayState>,
) -> Result<HttpResponse, RelayError> {
    app_state.relay_chat(&body).await
}

#[post("/generate")]
pub async fn generate(
    req: web::Json<serde_json::Value>,
    app_state: web::Data<RelayState>,
) -> Result<HttpResponse, RelayError> {
    app_state.relay_generate(&req.into_inner()).await
}

pub async fn periodic_logging(app_state: web::Data<RelayState>, interval: u64) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
        log::info!("cached responses: {}", app_state.cache_len());
    }
}

pub async fn startup(
    config: RelayConfig,
    app_state: web::Data<RelayState>,
) -> std::io::Result<()> {
    println!("Starting relay at {}:{}", config.host, config.port);

    // default level is info
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .init();

    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .service(health)
            .service(models)
            .service(chat_completions)
            .service(generate)
    })
    .bind((config.host, config.port))?
    .run()
    .await
}
