//! Loopback JSON endpoint over [`ProxyControl`]
//!
//! One request per connection:
//!
//! - `GET /status`
//! - `GET /history`
//! - `PUT /blocking?active=<bool>`
//! - `PUT /private-mode?enabled=<bool>`
//! - `POST /blocklist/reload`

use super::control::ProxyControl;
use crate::models::{HttpMethod, Scheme};
use crate::proxy::http::{self as wire, HttpError, RequestHead};
use crate::proxy::server::back_off_after_accept_error;
use http::StatusCode;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

const JSON: &str = "application/json";

pub async fn serve(
    listener: TcpListener,
    control: ProxyControl,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!("Admin endpoint listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => {
                    let control = control.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_admin_connection(socket, &control).await {
                            tracing::debug!("Admin connection ended: {}", e);
                        }
                    });
                }
                Err(e) => back_off_after_accept_error("Admin", &e).await,
            },
        }
    }
    Ok(())
}

pub async fn handle_admin_connection<S>(stream: S, control: &ProxyControl) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let (status, body) = match wire::read_request_head(&mut reader, Scheme::Http).await {
        Ok(Some(head)) => route(control, &head).await,
        Ok(None) | Err(HttpError::UnexpectedEof) => return Ok(()),
        Err(err) => error_body(err.status(), &err.to_string()),
    };
    wire::respond_with_status(reader.get_mut(), status, &[], JSON, &body, false).await?;
    Ok(())
}

async fn route(control: &ProxyControl, head: &RequestHead) -> (StatusCode, String) {
    let (path, query) = head
        .target
        .path
        .split_once('?')
        .unwrap_or((head.target.path.as_str(), ""));
    tracing::debug!("Admin {} {}", head.method, path);

    match (&head.method, path) {
        (HttpMethod::Get, "/status") => json(&control.status()),
        (HttpMethod::Get, "/history") => json(&control.get_history()),
        (HttpMethod::Put, "/blocking") => match bool_param(query, "active") {
            Some(active) => {
                control.set_blocking_active(active);
                json(&control.status())
            }
            None => error_body(StatusCode::BAD_REQUEST, "expected ?active=true|false"),
        },
        (HttpMethod::Put, "/private-mode") => match bool_param(query, "enabled") {
            Some(enabled) => {
                control.set_private_mode(enabled);
                json(&control.status())
            }
            None => error_body(StatusCode::BAD_REQUEST, "expected ?enabled=true|false"),
        },
        (HttpMethod::Post, "/blocklist/reload") => match control.reload_blocklist().await {
            Ok(stats) => json(&stats),
            Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        },
        (_, "/status" | "/history" | "/blocking" | "/private-mode" | "/blocklist/reload") => {
            error_body(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => error_body(StatusCode::NOT_FOUND, "not found"),
    }
}

fn bool_param(query: &str, name: &str) -> Option<bool> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| match value {
            "true" | "1" | "on" => Some(true),
            "false" | "0" | "off" => Some(false),
            _ => None,
        })
}

fn json<T: Serialize>(value: &T) -> (StatusCode, String) {
    match serde_json::to_string(value) {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn error_body(status: StatusCode, message: &str) -> (StatusCode, String) {
    (status, serde_json::json!({ "error": message }).to_string())
}
