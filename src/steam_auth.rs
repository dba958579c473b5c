//! Interactive Steam login over the IAuthenticationService web API.
//!
//! The password is RSA-encrypted with the account's public key, a Steam Guard
//! challenge is answered if one is required, and the session is polled until
//! Steam issues tokens. The resulting `steamLoginSecure` cookie is what the
//! community site accepts.

use crate::error::AcquireError;
use crate::session::{Identity, IdentityProvider, Session, SessionCookie};
use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPublicKey};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;

const API_BASE: &str = "https://api.steampowered.com/IAuthenticationService";
const COMMUNITY_DOMAIN: &str = "steamcommunity.com";
const MAX_POLLS: u32 = 30;

/// How Steam wants the login confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    None,
    EmailCode,
    DeviceCode,
    DeviceConfirmation,
    EmailConfirmation,
}

impl GuardKind {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::None),
            2 => Some(Self::EmailCode),
            3 => Some(Self::DeviceCode),
            4 => Some(Self::DeviceConfirmation),
            5 => Some(Self::EmailConfirmation),
            _ => None,
        }
    }

    fn code(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::EmailCode => 2,
            Self::DeviceCode => 3,
            Self::DeviceConfirmation => 4,
            Self::EmailConfirmation => 5,
        }
    }
}

/// Pick the confirmation to use from what Steam allows.
///
/// Codes typed at the terminal are preferred over out-of-band approval.
pub fn choose_confirmation(allowed: &[u32]) -> GuardKind {
    let kinds: Vec<GuardKind> = allowed.iter().filter_map(|c| GuardKind::from_code(*c)).collect();
    [
        GuardKind::None,
        GuardKind::DeviceCode,
        GuardKind::EmailCode,
        GuardKind::DeviceConfirmation,
        GuardKind::EmailConfirmation,
    ]
    .into_iter()
    .find(|k| kinds.contains(k))
    .unwrap_or(GuardKind::None)
}

/// Source of secrets typed by the user
pub trait CredentialPrompt {
    fn password(&self, account: &str) -> Result<String>;
    fn guard_code(&self, account: &str, kind: GuardKind) -> Result<String>;
    fn notify(&self, message: &str);
}

/// Reads the password without echo and everything else through a line editor
pub struct TerminalPrompt;

impl CredentialPrompt for TerminalPrompt {
    fn password(&self, account: &str) -> Result<String> {
        rpassword::prompt_password(format!("Steam password for {}: ", account))
            .context("reading password")
    }

    fn guard_code(&self, _account: &str, kind: GuardKind) -> Result<String> {
        let prompt = match kind {
            GuardKind::EmailCode => "Steam Guard code from email: ",
            _ => "Steam Guard code from the mobile app: ",
        };
        read_line(prompt)
    }

    fn notify(&self, message: &str) {
        eprintln!("{}", message);
    }
}

/// Read one trimmed line from the terminal
pub fn read_line(prompt: &str) -> Result<String> {
    let mut rl = DefaultEditor::new()?;
    match rl.readline(prompt) {
        Ok(line) => Ok(line.trim().to_string()),
        Err(ReadlineError::Interrupted | ReadlineError::Eof) => bail!("input cancelled"),
        Err(e) => Err(e).context("reading input"),
    }
}

pub struct SteamLogin {
    agent: ureq::Agent,
    prompt: Box<dyn CredentialPrompt>,
    user_agent: String,
}

impl SteamLogin {
    pub fn new(prompt: Box<dyn CredentialPrompt>, user_agent: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(30))
                .timeout_read(Duration::from_secs(60))
                .build(),
            prompt,
            user_agent: user_agent.into(),
        }
    }

    fn authenticate(&self, account: &str) -> Result<Identity> {
        let key: RsaKeyResponse = self
            .get("GetPasswordRSAPublicKey", &[("account_name", account)])
            .context("fetching RSA key")?;
        if key.publickey_mod.is_empty() {
            bail!("Steam returned no public key for this account");
        }

        let password = self.prompt.password(account)?;
        let encrypted = encrypt_password(&password, &key.publickey_mod, &key.publickey_exp)?;

        let begin: BeginAuthResponse = self
            .post(
                "BeginAuthSessionViaCredentials",
                &[
                    ("account_name", account),
                    ("encrypted_password", encrypted.as_str()),
                    ("encryption_timestamp", key.timestamp.as_str()),
                    ("remember_login", "true"),
                    ("persistence", "1"),
                    ("website_id", "Community"),
                    ("device_friendly_name", "cs2dl"),
                ],
            )
            .context("starting auth session")?;
        if begin.client_id.is_empty() {
            let reason = if begin.extended_error_message.is_empty() {
                "invalid credentials".to_string()
            } else {
                begin.extended_error_message.clone()
            };
            bail!("{}", reason);
        }
        tracing::debug!(account, steam_id = %begin.steamid, "auth session started");

        let allowed: Vec<u32> = begin
            .allowed_confirmations
            .iter()
            .map(|c| c.confirmation_type)
            .collect();
        match choose_confirmation(&allowed) {
            GuardKind::None => {}
            kind @ (GuardKind::DeviceCode | GuardKind::EmailCode) => {
                let code = self.prompt.guard_code(account, kind)?;
                let code_type = kind.code().to_string();
                let _: Value = self
                    .post(
                        "UpdateAuthSessionWithSteamGuardCode",
                        &[
                            ("client_id", begin.client_id.as_str()),
                            ("steamid", begin.steamid.as_str()),
                            ("code", code.as_str()),
                            ("code_type", code_type.as_str()),
                        ],
                    )
                    .context("submitting Steam Guard code")?;
            }
            GuardKind::DeviceConfirmation => {
                self.prompt.notify("Approve the sign-in in the Steam mobile app...");
            }
            GuardKind::EmailConfirmation => {
                self.prompt.notify("Approve the sign-in from the link Steam emailed you...");
            }
        }

        let interval = Duration::from_secs_f32(begin.interval.clamp(1.0, 30.0));
        for attempt in 1..=MAX_POLLS {
            let status: PollResponse = self
                .post(
                    "PollAuthSessionStatus",
                    &[
                        ("client_id", begin.client_id.as_str()),
                        ("request_id", begin.request_id.as_str()),
                    ],
                )
                .context("polling auth session")?;
            if !status.access_token.is_empty() {
                tracing::debug!(account, attempt, "auth session confirmed");
                return Ok(Identity {
                    steam_id: begin.steamid,
                    access_token: status.access_token,
                    refresh_token: status.refresh_token,
                    client_id: begin.client_id,
                    request_id: begin.request_id,
                });
            }
            tracing::debug!(account, attempt, "waiting for confirmation");
            std::thread::sleep(interval);
        }

        Err(anyhow!("sign-in was not confirmed after {} polls", MAX_POLLS))
    }

    fn get<T>(&self, method: &str, query: &[(&str, &str)]) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let mut req = self
            .agent
            .get(&format!("{}/{}/v1/", API_BASE, method))
            .set("User-Agent", &self.user_agent);
        for (k, v) in query {
            req = req.query(k, v);
        }
        read_envelope(method, req.call())
    }

    fn post<T>(&self, method: &str, form: &[(&str, &str)]) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let resp = self
            .agent
            .post(&format!("{}/{}/v1/", API_BASE, method))
            .set("User-Agent", &self.user_agent)
            .send_form(form);
        read_envelope(method, resp)
    }
}

impl IdentityProvider for SteamLogin {
    fn login(&self, account: &str) -> Result<Session, AcquireError> {
        let identity = self
            .authenticate(account)
            .map_err(|e| AcquireError::auth(account, format!("{:#}", e)))?;
        tracing::info!(account, steam_id = %identity.steam_id, "signed in to Steam");
        Ok(session_from_identity(account, identity, &self.user_agent))
    }
}

/// Build the community-site session for freshly issued tokens
pub fn session_from_identity(account: &str, identity: Identity, user_agent: &str) -> Session {
    let cookie = |name: &str, value: String, http_only: bool| SessionCookie {
        name: name.to_string(),
        value,
        domain: COMMUNITY_DOMAIN.to_string(),
        path: "/".to_string(),
        secure: true,
        http_only,
    };

    let login_secure = format!("{}%7C%7C{}", identity.steam_id, identity.access_token);
    let session_id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(24).collect();

    Session {
        account: account.to_string(),
        cookies: vec![
            cookie("steamLoginSecure", login_secure, true),
            cookie("sessionid", session_id, false),
        ],
        identity,
        user_agent: user_agent.to_string(),
        created_at: chrono::Utc::now(),
    }
}

/// RSA/PKCS#1 v1.5 encrypt the password with a hex-encoded public key
pub fn encrypt_password(password: &str, modulus_hex: &str, exponent_hex: &str) -> Result<String> {
    let n = BigUint::from_bytes_be(&hex::decode(modulus_hex).context("decoding key modulus")?);
    let e = BigUint::from_bytes_be(&hex::decode(exponent_hex).context("decoding key exponent")?);
    let key = RsaPublicKey::new(n, e).context("building public key")?;
    let encrypted = key
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, password.as_bytes())
        .context("encrypting password")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(encrypted))
}

fn read_envelope<T: DeserializeOwned + Default>(
    method: &str,
    result: Result<ureq::Response, ureq::Error>,
) -> Result<T> {
    let resp = match result {
        Ok(resp) => resp,
        Err(ureq::Error::Status(code, resp)) => bail!(
            "{} returned HTTP {} (eresult {})",
            method,
            code,
            resp.header("x-eresult").unwrap_or("?")
        ),
        Err(e) => return Err(e).with_context(|| format!("calling {}", method)),
    };

    let eresult = resp.header("x-eresult").map(str::to_string);
    let envelope: Envelope<T> = resp
        .into_json()
        .with_context(|| format!("decoding {} response", method))?;
    match eresult.as_deref() {
        None | Some("1") => Ok(envelope.response),
        Some(code) => bail!("{} failed with eresult {}", method, code),
    }
}

#[derive(Deserialize)]
struct Envelope<T: Default> {
    #[serde(default)]
    response: T,
}

#[derive(Debug, Default, Deserialize)]
struct RsaKeyResponse {
    #[serde(default)]
    publickey_mod: String,
    #[serde(default)]
    publickey_exp: String,
    #[serde(default, deserialize_with = "de_id")]
    timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
struct BeginAuthResponse {
    #[serde(default, deserialize_with = "de_id")]
    client_id: String,
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    interval: f32,
    #[serde(default)]
    allowed_confirmations: Vec<AllowedConfirmation>,
    #[serde(default, deserialize_with = "de_id")]
    steamid: String,
    #[serde(default)]
    extended_error_message: String,
}

#[derive(Debug, Default, Deserialize)]
struct AllowedConfirmation {
    #[serde(default)]
    confirmation_type: u32,
}

#[derive(Debug, Default, Deserialize)]
struct PollResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
}

/// 64-bit ids arrive as strings or numbers depending on the endpoint
fn de_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!("unexpected id value {}", other))),
    }
}
