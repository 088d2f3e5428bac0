//! Local HTTP server for adapter tests.

use actix_web::{web, App, HttpServer};

/// Serve `routes` on an ephemeral loopback port and return its base URL.
///
/// Must be called inside an actix system (`#[actix_web::test]`). The server
/// lives until the test's runtime shuts down.
pub(crate) fn serve<F>(routes: F) -> String
where
    F: Fn(&mut web::ServiceConfig) + Send + Clone + 'static,
{
    let server = HttpServer::new(move || App::new().configure(routes.clone()))
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .expect("bind test server");
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    format!("http://{}", addr)
}
