use std::{
    io::{self, BufRead, Write},
    sync::Mutex,
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use client_core::CredentialProvider;
use shared::protocol::{CodeDelivery, SentCode};

/// Prompts on stdout and reads answers from stdin.
///
/// Reads run on the blocking pool; the auth flow drops the pending read when
/// the session is cancelled.
pub struct TerminalCredentials {
    phone: Mutex<Option<String>>,
}

impl TerminalCredentials {
    /// `phone` answers the first phone prompt; later prompts ask.
    pub fn new(phone: Option<String>) -> Self {
        Self {
            phone: Mutex::new(phone),
        }
    }
}

async fn read_line(prompt: String) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        let mut stdout = io::stdout().lock();
        write!(stdout, "{prompt}")?;
        stdout.flush()?;
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(anyhow!("stdin closed"));
        }
        Ok(line.trim().to_string())
    })
    .await
    .context("prompt task failed")?
}

/// Like [`read_line`] but without echoing what is typed.
async fn read_secret(prompt: String) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        let secret = rpassword::prompt_password(prompt).context("failed to read password")?;
        Ok(secret.trim().to_string())
    })
    .await
    .context("prompt task failed")?
}

#[async_trait]
impl CredentialProvider for TerminalCredentials {
    async fn phone(&self) -> anyhow::Result<String> {
        let preset = self.phone.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(phone) = preset {
            return Ok(phone);
        }
        read_line("Phone number (international format, e.g. +15551234567): ".into()).await
    }

    async fn code(&self, sent: &SentCode) -> anyhow::Result<String> {
        read_line(code_prompt(sent)).await
    }

    async fn password(&self, hint: Option<&str>) -> anyhow::Result<String> {
        read_secret(password_prompt(hint)).await
    }
}

fn code_prompt(sent: &SentCode) -> String {
    let via = match sent.delivery {
        CodeDelivery::App => "in the app",
        CodeDelivery::Sms => "by SMS",
        CodeDelivery::Call => "by phone call",
        CodeDelivery::Email => "by email",
    };
    format!("Login code (sent {via}): ")
}

fn password_prompt(hint: Option<&str>) -> String {
    match hint {
        Some(hint) => format!("2FA password (hint: {hint}): "),
        None => "2FA password: ".to_string(),
    }
}

#[cfg(test)]
#[path = "tests/terminal_tests.rs"]
mod tests;
