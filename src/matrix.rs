use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use matrix_bot_sdk::{
    appservice::Appservice,
    client::{MatrixAuth, MatrixClient},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::config::Config;

const POWER_LEVELS_EVENT: &str = "m.room.power_levels";

/// Client errors that will fail the same way however often they are retried.
const PERMANENT_ERRCODES: &[&str] = &[
    "M_BAD_JSON",
    "M_BAD_STATE",
    "M_FORBIDDEN",
    "M_GUEST_ACCESS_FORBIDDEN",
    "M_INVALID_PARAM",
    "M_MISSING_TOKEN",
    "M_NOT_FOUND",
    "M_NOT_JSON",
    "M_TOO_LARGE",
    "M_UNKNOWN_TOKEN",
    "M_UNRECOGNIZED",
];

/// A request the homeserver answered with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeserverRejection {
    pub request: String,
    pub status: Option<u16>,
    pub errcode: Option<String>,
    pub detail: String,
}

impl HomeserverRejection {
    fn from_body(request: &str, status: Option<u16>, body: &Value) -> Self {
        Self {
            request: request.to_string(),
            status,
            errcode: body
                .get("errcode")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            detail: body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Rate limits and server faults may clear up; other 4xx answers will not.
    pub fn is_permanent(&self) -> bool {
        if self.errcode.as_deref() == Some("M_LIMIT_EXCEEDED") {
            return false;
        }
        match self.status {
            Some(status) => (400..500).contains(&status) && status != 429,
            None => self
                .errcode
                .as_deref()
                .is_some_and(|code| PERMANENT_ERRCODES.contains(&code)),
        }
    }
}

impl fmt::Display for HomeserverRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rejected", self.request)?;
        if let Some(status) = self.status {
            write!(f, " with status {status}")?;
        }
        if let Some(errcode) = &self.errcode {
            write!(f, ": {errcode}")?;
        }
        if !self.detail.is_empty() {
            write!(f, " {}", self.detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for HomeserverRejection {}

/// Public profile of a Matrix user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// The slice of the Matrix client-server API the bridge core drives.
#[async_trait]
pub trait MatrixApi: Send + Sync {
    /// Registers the ghost user if it does not exist yet. Idempotent.
    async fn ensure_registered(&self, matrix_user_id: &str) -> Result<()>;
    async fn get_profile(&self, matrix_user_id: &str) -> Result<MatrixProfile>;
    async fn set_profile(&self, matrix_user_id: &str, profile: &MatrixProfile) -> Result<()>;
    /// Current `users` map of the room's power level state.
    async fn get_power_levels(&self, matrix_room_id: &str) -> Result<BTreeMap<String, i64>>;
    /// Merges `changes` into the room's power level `users` map. `None` removes the entry.
    async fn set_room_power_levels(
        &self,
        matrix_room_id: &str,
        changes: &BTreeMap<String, Option<i64>>,
    ) -> Result<()>;
    async fn send_message(&self, matrix_room_id: &str, sender: &str, content: &Value)
    -> Result<String>;
}

#[derive(Clone)]
pub struct MatrixAppservice {
    config: Arc<Config>,
    appservice: Appservice,
    http: reqwest::Client,
    homeserver_url: Url,
    // matrix-bot-sdk impersonation is client-wide state
    impersonation_lock: Arc<Mutex<()>>,
}

impl MatrixAppservice {
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        info!(
            "initializing matrix appservice for {}",
            config.bridge.domain
        );

        let homeserver_url = Url::parse(&config.bridge.homeserver_url)?;
        let auth = MatrixAuth::new(&config.registration.appservice_token);
        let client = MatrixClient::new(homeserver_url.clone(), auth);

        let appservice = Appservice::new(
            &config.registration.homeserver_token,
            &config.registration.appservice_token,
            client,
        )
        .with_appservice_id(&config.registration.bridge_id);

        let http = reqwest::Client::builder()
            .timeout(config.matrix.request_timeout())
            .build()
            .context("failed to build matrix http client")?;

        Ok(Self {
            config,
            appservice,
            http,
            homeserver_url,
            impersonation_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    pub fn bot_user_id(&self) -> String {
        self.config.bridge.bot_user_id()
    }

    fn client_url(&self, segments: &[&str], as_user: Option<&str>) -> Result<Url> {
        let mut url = self.homeserver_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("homeserver url cannot be a base"))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        if let Some(user) = as_user {
            url.query_pairs_mut().append_pair("user_id", user);
        }
        Ok(url)
    }

    /// Returns the JSON body of a successful response and a `HomeserverRejection` otherwise.
    async fn read_response(response: reqwest::Response, request: &str) -> Result<Value> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let json = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(json);
        }
        Err(HomeserverRejection::from_body(request, Some(status.as_u16()), &json).into())
    }

    async fn put_json(&self, url: Url, body: &Value, request: &str) -> Result<Value> {
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.config.registration.appservice_token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{request} failed"))?;
        Self::read_response(response, request).await
    }

    async fn put_profile_field(&self, matrix_user_id: &str, field: &str, body: Value) -> Result<()> {
        let url = self.client_url(&["profile", matrix_user_id, field], Some(matrix_user_id))?;
        self.put_json(url, &body, &format!("setting {field} of {matrix_user_id}"))
            .await?;
        Ok(())
    }

    async fn power_levels_content(&self, matrix_room_id: &str) -> Result<Value> {
        let content = self
            .appservice
            .client
            .get_room_state_event(matrix_room_id, POWER_LEVELS_EVENT, "")
            .await
            .map_err(|e| anyhow!("failed to read power levels of {matrix_room_id}: {e}"))?;
        // the sdk hands error bodies back as content
        match content.get("errcode").and_then(Value::as_str) {
            None => Ok(content),
            Some("M_NOT_FOUND") => Ok(json!({})),
            Some(_) => Err(HomeserverRejection::from_body(
                &format!("reading power levels of {matrix_room_id}"),
                None,
                &content,
            )
            .into()),
        }
    }
}

fn localpart(matrix_user_id: &str) -> &str {
    matrix_user_id
        .trim_start_matches('@')
        .split_once(':')
        .map(|(local, _)| local)
        .unwrap_or(matrix_user_id)
}

fn users_map(content: &Value) -> BTreeMap<String, i64> {
    content
        .get("users")
        .and_then(Value::as_object)
        .map(|users| {
            users
                .iter()
                .filter_map(|(user, level)| level.as_i64().map(|level| (user.clone(), level)))
                .collect()
        })
        .unwrap_or_default()
}

fn merge_power_levels(content: &mut Value, changes: &BTreeMap<String, Option<i64>>) {
    if !content.is_object() {
        *content = json!({});
    }
    if !content.get("users").is_some_and(Value::is_object) {
        content["users"] = json!({});
    }
    if let Some(users) = content["users"].as_object_mut() {
        for (user, level) in changes {
            match level {
                Some(level) => {
                    users.insert(user.clone(), json!(level));
                }
                None => {
                    users.remove(user);
                }
            }
        }
    }
}

#[async_trait]
impl MatrixApi for MatrixAppservice {
    async fn ensure_registered(&self, matrix_user_id: &str) -> Result<()> {
        let _guard = self.impersonation_lock.lock().await;
        let client = self.appservice.client.clone();
        client
            .impersonate_user_id(Some(matrix_user_id), None::<&str>)
            .await;

        let result = client
            .password_register(localpart(matrix_user_id), "", None::<&str>)
            .await;
        client.impersonate_user_id(None::<&str>, None::<&str>).await;

        match result {
            Ok(_) => {
                debug!("registered ghost user {}", matrix_user_id);
                Ok(())
            }
            Err(e) if e.to_string().contains("M_USER_IN_USE") => Ok(()),
            Err(e) => Err(anyhow!("failed to register {matrix_user_id}: {e}")),
        }
    }

    async fn get_profile(&self, matrix_user_id: &str) -> Result<MatrixProfile> {
        let request = format!("fetching profile of {matrix_user_id}");
        let response = self
            .http
            .get(self.client_url(&["profile", matrix_user_id], Some(matrix_user_id))?)
            .bearer_auth(&self.config.registration.appservice_token)
            .send()
            .await
            .with_context(|| format!("{request} failed"))?;

        // freshly registered users may not have a profile yet
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(MatrixProfile::default());
        }
        let body = Self::read_response(response, &request).await?;
        serde_json::from_value(body).with_context(|| format!("invalid profile for {matrix_user_id}"))
    }

    async fn set_profile(&self, matrix_user_id: &str, profile: &MatrixProfile) -> Result<()> {
        self.put_profile_field(
            matrix_user_id,
            "displayname",
            json!({ "displayname": profile.displayname }),
        )
        .await?;
        self.put_profile_field(
            matrix_user_id,
            "avatar_url",
            json!({ "avatar_url": profile.avatar_url.clone().unwrap_or_default() }),
        )
        .await
    }

    async fn get_power_levels(&self, matrix_room_id: &str) -> Result<BTreeMap<String, i64>> {
        let content = self.power_levels_content(matrix_room_id).await?;
        Ok(users_map(&content))
    }

    async fn set_room_power_levels(
        &self,
        matrix_room_id: &str,
        changes: &BTreeMap<String, Option<i64>>,
    ) -> Result<()> {
        let mut content = self.power_levels_content(matrix_room_id).await?;
        merge_power_levels(&mut content, changes);

        let url = self.client_url(&["rooms", matrix_room_id, "state", POWER_LEVELS_EVENT, ""], None)?;
        self.put_json(
            url,
            &content,
            &format!("writing power levels of {matrix_room_id}"),
        )
        .await?;
        debug!(
            "applied {} power level changes in {}",
            changes.len(),
            matrix_room_id
        );
        Ok(())
    }

    async fn send_message(
        &self,
        matrix_room_id: &str,
        sender: &str,
        content: &Value,
    ) -> Result<String> {
        let _guard = self.impersonation_lock.lock().await;
        let client = self.appservice.client.clone();
        client.impersonate_user_id(Some(sender), None::<&str>).await;

        let result = client
            .send_event(matrix_room_id, "m.room.message", content)
            .await;
        client.impersonate_user_id(None::<&str>, None::<&str>).await;

        result.map_err(|e| anyhow!("failed to send message to {matrix_room_id}: {e}"))
    }
}
