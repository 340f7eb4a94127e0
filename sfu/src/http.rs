use actix::{Actor, ActorContext, Addr, AsyncContext, Handler, Message, StreamHandler};
use actix_web::{
    http::header::ContentType,
    web::{self, Data},
    HttpRequest, HttpResponse, Responder,
};
use actix_web_actors::ws;
use confab::protocol::{ClientEnvelope, ServerMessage};
use enclose::enc;
use tokio::sync::mpsc;

use crate::manager::{ConnectionHandle, RoomManager};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Registers the signaling socket and the operational endpoints. The app needs a
/// [`Data<RoomManager>`].
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready))
        .route("/metrics", web::get().to(metrics))
        .route("/socket", web::get().to(socket));
}

async fn health(manager: Data<RoomManager>) -> impl Responder {
    HttpResponse::Ok().json(manager.summary().await)
}

async fn ready(manager: Data<RoomManager>) -> impl Responder {
    if manager.is_ready() {
        HttpResponse::Ok().body("ready")
    } else {
        HttpResponse::ServiceUnavailable().body("workers are not running")
    }
}

async fn metrics(manager: Data<RoomManager>) -> impl Responder {
    match manager.export() {
        Ok(text) => HttpResponse::Ok()
            .content_type(PROMETHEUS_CONTENT_TYPE)
            .body(text),
        Err(err) => {
            tracing::error!("failed to export metrics: {}", err);
            HttpResponse::InternalServerError()
                .content_type(ContentType::plaintext())
                .body(err.to_string())
        }
    }
}

async fn socket(
    req: HttpRequest,
    manager: Data<RoomManager>,
    stream: web::Payload,
) -> Result<HttpResponse, actix_web::Error> {
    ws::start(WebSocket::new(manager.get_ref().clone()), &req, stream)
}

/// One signaling connection. Inbound text frames are handed to the [`RoomManager`], and
/// whatever the manager queues for the peer is written back as text frames.
struct WebSocket {
    manager: RoomManager,
    connection: Option<ConnectionHandle>,
}

impl WebSocket {
    fn new(manager: RoomManager) -> Self {
        Self {
            manager,
            connection: None,
        }
    }

    fn forward(address: Addr<Self>, mut outbox: mpsc::UnboundedReceiver<ServerMessage>) {
        tokio::spawn(enc!((address) async move {
            while let Some(message) = outbox.recv().await {
                if !address.connected() {
                    break;
                }
                address.do_send(Outgoing(message));
            }
        }));
    }
}

impl Actor for WebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = self.manager.connect(tx);
        tracing::info!("WebSocket connection of peer {} is started", connection.peer_id);
        Self::forward(ctx.address(), rx);
        self.connection = Some(connection);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the handle ends the connection task, which leaves the room.
        if let Some(connection) = self.connection.take() {
            tracing::info!("WebSocket connection of peer {} is stopped", connection.peer_id);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocket {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => tracing::trace!("pong received"),
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientEnvelope>(&text) {
                Ok(envelope) => {
                    let Some(connection) = self.connection.as_ref() else {
                        return;
                    };
                    if connection.inbound.send(envelope).is_err() {
                        tracing::warn!("connection task of peer {} is gone", connection.peer_id);
                        ctx.stop();
                    }
                }
                Err(error) => {
                    tracing::error!("failed to parse client message: {}\n{}", error, text);
                }
            },
            Ok(ws::Message::Binary(_)) => tracing::debug!("binary frames are not supported"),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(error) => {
                tracing::warn!("websocket protocol error: {}", error);
                ctx.stop();
            }
            _ => (),
        }
    }
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
struct Outgoing(ServerMessage);

impl Handler<Outgoing> for WebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outgoing, ctx: &mut Self::Context) -> Self::Result {
        match serde_json::to_string(&msg.0) {
            Ok(text) => ctx.text(text),
            Err(error) => tracing::error!("failed to serialize server message: {}", error),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use actix_web::{test, App};

    use super::*;
    use crate::{backend::test::backend, config::ServerConfig};

    fn manager() -> RoomManager {
        let config = ServerConfig {
            worker_count: 1,
            stats_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        RoomManager::new(config, Arc::new(backend())).expect("failed to start manager")
    }

    #[actix_web::test]
    async fn health_lists_no_rooms_on_a_fresh_server() {
        let app = test::init_service(
            App::new()
                .app_data(Data::new(manager()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rooms"], serde_json::json!([]));
    }

    #[actix_web::test]
    async fn metrics_use_the_prometheus_text_format() {
        let app = test::init_service(
            App::new()
                .app_data(Data::new(manager()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let res = test::call_service(&app, req).await;
        assert!(res.status().is_success());
        assert_eq!(
            res.headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some(PROMETHEUS_CONTENT_TYPE)
        );
        let body = test::read_body(res).await;
        assert!(String::from_utf8_lossy(&body).contains("confab_active_rooms 0"));
    }

    #[actix_web::test]
    async fn ready_once_workers_run() {
        let app = test::init_service(
            App::new()
                .app_data(Data::new(manager()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/ready").to_request();
        let res = test::call_service(&app, req).await;
        assert!(res.status().is_success());
    }
}
