use anyhow::{Context, Result};
use dialoguer::Password;
use reqwest::Method;

use authflow::auth::{expires_after, redact, Credential};
use authflow::config::{Command, Config};
use authflow::error::ApiError;
use authflow::http_client::RequestConfig;
use authflow::AuthPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(
        base_url = %config.api_base_url,
        backend = ?config.storage_backend,
        "Configuration loaded"
    );

    let pipeline = AuthPipeline::from_config(&config)
        .await
        .context("Failed to open credential storage")?;

    match command {
        Command::Status => print_status(&pipeline).await,

        Command::Login {
            access_token,
            refresh_token,
            email,
            expires_in,
        } => {
            let refresh_token = match refresh_token {
                Some(token) => token,
                None => Password::new()
                    .with_prompt("Refresh token")
                    .interact()
                    .context("Failed to read refresh token")?,
            };
            let expires_at = expires_in.map(expires_after);

            pipeline
                .sign_in(
                    Credential::new(access_token, refresh_token, expires_at),
                    email.as_deref(),
                )
                .await?;
            print_status(&pipeline).await
        }

        Command::Logout => {
            if pipeline.sign_out().await? {
                println!("Signed out");
            } else {
                println!("Already signed out");
            }
            Ok(())
        }

        Command::Refresh => match pipeline.refresh().await {
            Ok(credential) => {
                println!(
                    "Refreshed: access token {}, expires {}",
                    redact(&credential.access_token),
                    credential
                        .expires_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
                Ok(())
            }
            Err(e) => report_failure(e),
        },

        Command::Request {
            path,
            method,
            data,
            public,
        } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut request = RequestConfig::new(method, path);
            if let Some(data) = data {
                serde_json::from_str::<serde_json::Value>(&data)
                    .context("--data must be valid JSON")?;
                request = request.with_body(data.into_bytes());
            }
            if public {
                request = request.public();
            }

            match pipeline.execute(request).await {
                Ok(response) => {
                    eprintln!("HTTP {}", response.status);
                    println!("{}", response.text());
                    if response.is_success() {
                        Ok(())
                    } else {
                        anyhow::bail!("Request returned {}", response.status)
                    }
                }
                Err(e) => report_failure(e),
            }
        }
    }
}

async fn print_status(pipeline: &AuthPipeline) -> Result<()> {
    let session = pipeline.session();
    println!("{}", serde_json::to_string_pretty(&session)?);

    if let Some(credential) = pipeline.credential().await? {
        tracing::info!(credential = ?credential, "Stored credential");
    }
    Ok(())
}

fn report_failure(err: ApiError) -> Result<()> {
    match &err {
        ApiError::Unauthenticated => {
            tracing::error!("Not signed in; run `authflow login` to authenticate");
        }
        e if e.is_retryable() => {
            tracing::warn!("Temporary failure, try again later: {}", e);
        }
        e => tracing::error!("{}", e),
    }
    Err(err.into())
}
