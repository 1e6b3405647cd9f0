use std::collections::HashMap;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

use super::Session;
use crate::config::AuthConfig;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// Per-file access: the app only sees files it created itself.
const SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const DEFAULT_PORT: u16 = 8080;

/// Installed-app authorization: open the consent page, wait for the
/// loopback redirect (or a pasted code) and store the tokens.
pub async fn run_auth_flow(auth: &AuthConfig, session: &Session) -> Result<()> {
    let port = auth.redirect_port.unwrap_or(DEFAULT_PORT);
    let redirect_uri = format!("http://127.0.0.1:{port}/callback");
    let state = random_state();
    let auth_url = authorization_url(session.client_id(), &redirect_uri, &state)?;

    session.begin_authorization().await;

    let code = match obtain_code(port, &auth_url, &state).await {
        Ok(code) => code,
        Err(e) => {
            session.cancel_authorization().await;
            return Err(e);
        }
    };

    println!("\nExchanging authorization code for tokens...");
    if let Err(e) = session.complete_authorization(&code, &redirect_uri).await {
        session.cancel_authorization().await;
        return Err(e);
    }

    println!(
        "Authorization successful! Tokens saved to {}",
        session.token_path().display()
    );
    Ok(())
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn authorization_url(client_id: &str, redirect_uri: &str, state: &str) -> Result<Url> {
    Ok(Url::parse_with_params(
        AUTH_URL,
        &[
            ("client_id", client_id),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri),
            ("scope", SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
        ],
    )?)
}

async fn obtain_code(port: u16, auth_url: &Url, state: &str) -> Result<String> {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(l) => {
            tracing::debug!(port, "listening for OAuth callback");
            Some(l)
        }
        Err(e) => {
            tracing::warn!(port, "could not bind for OAuth callback: {e}");
            None
        }
    };

    println!("\nOpen this URL in your browser to authorize drivesyncd:\n");
    println!("  {auth_url}\n");

    // Headless machines have no browser; the printed URL is enough
    let _ = open::that(auth_url.as_str());

    match listener {
        Some(l) => {
            println!("Waiting for authorization...");
            println!("If the browser runs on another machine, paste the redirect URL or code here:");
            tokio::select! {
                result = accept_callback(&l, state) => result,
                result = read_stdin() => parse_code_input(&result?),
            }
        }
        None => {
            println!("Paste the redirect URL or authorization code here:");
            parse_code_input(&read_stdin().await?)
        }
    }
}

/// Serve the loopback redirect until a request carries a code.
async fn accept_callback(listener: &TcpListener, expected_state: &str) -> Result<String> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        tracing::debug!(%addr, "incoming connection");

        let mut buf = vec![0u8; 8192];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);
        let target = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("");

        match check_callback(target, expected_state) {
            Callback::Ignore => {
                let _ = stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
            Callback::Denied(reason) => {
                send_html(&mut stream, "200 OK", "<h1>Authorization failed</h1>").await;
                anyhow::bail!("Authorization denied: {reason}");
            }
            Callback::StateMismatch => {
                send_html(&mut stream, "400 Bad Request", "<h1>Invalid state</h1>").await;
                anyhow::bail!("OAuth state mismatch, refusing the callback");
            }
            Callback::Code(code) => {
                send_html(
                    &mut stream,
                    "200 OK",
                    "<h1>Authorization successful!</h1>\
                     <p>You can close this tab and return to the terminal.</p>",
                )
                .await;
                return Ok(code);
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Callback {
    Ignore,
    Denied(String),
    StateMismatch,
    Code(String),
}

fn check_callback(target: &str, expected_state: &str) -> Callback {
    if !target.starts_with("/callback") {
        return Callback::Ignore;
    }
    let Ok(url) = Url::parse(&format!("http://localhost{target}")) else {
        return Callback::Ignore;
    };
    let params: HashMap<_, _> = url.query_pairs().collect();

    if let Some(error) = params.get("error") {
        return Callback::Denied(error.to_string());
    }
    let Some(code) = params.get("code") else {
        return Callback::Ignore;
    };
    if params.get("state").map(|s| s.as_ref()) != Some(expected_state) {
        return Callback::StateMismatch;
    }
    Callback::Code(code.to_string())
}

async fn send_html(stream: &mut (impl AsyncWriteExt + Unpin), status: &str, body: &str) {
    let body = format!("<html><body>{body}</body></html>");
    let resp = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n\
         {body}",
        body.len()
    );
    let _ = stream.write_all(resp.as_bytes()).await;
}

async fn read_stdin() -> Result<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .context("stdin reader panicked")?
}

/// Accept either the full redirect URL or the bare code.
fn parse_code_input(input: &str) -> Result<String> {
    let input = input.trim();
    anyhow::ensure!(!input.is_empty(), "Empty input");

    if let Ok(url) = Url::parse(input)
        && let Some((_, code)) = url.query_pairs().find(|(k, _)| k == "code")
    {
        return Ok(code.into_owned());
    }
    Ok(input.to_string())
}
