//! Reddit over its OAuth2 JSON API.
//!
//! Authentication uses the password grant of a "script" application. The
//! token is refreshed shortly before it expires. Every call is spaced at least
//! `reddit.request_delay_ms` after the previous one.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, instrument, warn};

use super::Platform;
use crate::config::RedditConfig;
use crate::error::{ApiErrorItem, PlatformError};
use crate::models::{FlairTemplate, Submission, WikiPage};

/// Tokens are renewed this long before the advertised expiry.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);
const REVISIONS_PAGE: &str = "100";
const SEARCH_LIMIT: &str = "25";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
struct AccessToken {
    value: String,
    renew_at: Instant,
}

#[derive(Debug, Deserialize)]
struct Me {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    children: Vec<Thing<T>>,
}

#[derive(Debug, Deserialize)]
struct Thing<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct WikiDocument {
    data: WikiContent,
}

#[derive(Debug, Deserialize)]
struct WikiContent {
    #[serde(default)]
    content_md: String,
}

#[derive(Debug, Deserialize)]
struct WikiRevisions {
    data: WikiRevisionData,
}

#[derive(Debug, Deserialize)]
struct WikiRevisionData {
    children: Vec<WikiRevision>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WikiRevision {
    #[serde(default)]
    author: Option<Thing<Me>>,
}

/// Structured errors of an `api_type=json` response, as `[code, message, field]` triples.
fn api_errors(body: &Value) -> Vec<ApiErrorItem> {
    let Some(errors) = body.pointer("/json/errors").and_then(Value::as_array) else {
        return Vec::new();
    };
    errors
        .iter()
        .filter_map(Value::as_array)
        .map(|triple| {
            let text = |i: usize| triple.get(i).and_then(Value::as_str).map(str::to_string);
            ApiErrorItem {
                code: text(0).unwrap_or_default(),
                message: text(1).unwrap_or_default(),
                field: text(2),
            }
        })
        .collect()
}

/// Fullname (`t3_…`) of the post created by `/api/submit`.
fn submitted_fullname(body: &Value) -> Result<String, PlatformError> {
    let errors = api_errors(body);
    if !errors.is_empty() {
        return Err(PlatformError::Api(errors));
    }
    let data = body.pointer("/json/data");
    let name = data.and_then(|d| d.get("name")).and_then(Value::as_str);
    let id = data.and_then(|d| d.get("id")).and_then(Value::as_str);
    match (name, id) {
        (Some(name), _) => Ok(name.to_string()),
        (None, Some(id)) => Ok(format!("t3_{id}")),
        (None, None) => Err(PlatformError::Decode(format!(
            "submit response without post id: {body}"
        ))),
    }
}

fn classify(status: StatusCode, url: &str) -> Result<(), PlatformError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() {
        Err(PlatformError::Service {
            status: status.as_u16(),
            url: url.to_string(),
        })
    } else {
        Err(PlatformError::Rejected {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

fn decode<T: DeserializeOwned>(url: &str, text: &str) -> Result<T, PlatformError> {
    serde_json::from_str(text).map_err(|e| PlatformError::Decode(format!("{url}: {e}")))
}

/// Authenticated Reddit API client.
#[derive(Debug)]
pub struct RedditClient {
    http: Client,
    config: RedditConfig,
    token: Mutex<Option<AccessToken>>,
    next_call: Mutex<Instant>,
}

impl RedditClient {
    /// Log in and verify that the token belongs to the configured account.
    #[instrument(level = "info", skip_all, fields(username = %config.username))]
    pub async fn connect(config: &RedditConfig) -> Result<Self, PlatformError> {
        let http = Client::builder()
            .user_agent(config.user_agent())
            .timeout(Duration::from_secs(60))
            .build()?;
        let client = Self {
            http,
            config: config.clone(),
            token: Mutex::new(None),
            next_call: Mutex::new(Instant::now()),
        };
        let me: Me = client.get_json("/api/v1/me", &[]).await?;
        if me.name != config.username {
            return Err(PlatformError::Auth(format!(
                "logged in as {} instead of {}",
                me.name, config.username
            )));
        }
        info!("Connected");
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.oauth_url.trim_end_matches('/'), path)
    }

    async fn authenticate(&self) -> Result<AccessToken, PlatformError> {
        let url = format!(
            "{}/api/v1/access_token",
            self.config.auth_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?;
        classify(resp.status(), &url)?;
        let token: TokenResponse = decode(&url, &resp.text().await?)?;
        match (token.access_token, token.error) {
            (Some(value), None) => {
                let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
                debug!(expires_in = lifetime.as_secs(), "Access token obtained");
                Ok(AccessToken {
                    value,
                    renew_at: Instant::now() + lifetime.saturating_sub(TOKEN_MARGIN),
                })
            }
            (_, Some(error)) => Err(PlatformError::Auth(error)),
            (None, None) => Err(PlatformError::Auth("no access token in response".to_string())),
        }
    }

    async fn bearer(&self) -> Result<String, PlatformError> {
        let mut guard = self.token.lock().await;
        match guard.as_ref() {
            Some(token) if token.renew_at > Instant::now() => Ok(token.value.clone()),
            _ => {
                let token = self.authenticate().await?;
                let value = token.value.clone();
                *guard = Some(token);
                Ok(value)
            }
        }
    }

    async fn throttle(&self) {
        let mut next = self.next_call.lock().await;
        sleep_until(*next).await;
        *next = Instant::now() + Duration::from_millis(self.config.request_delay_ms);
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<T, PlatformError> {
        self.throttle().await;
        let token = self.bearer().await?;
        let resp = request.bearer_auth(token).send().await?;
        classify(resp.status(), url)?;
        decode(url, &resp.text().await?)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, PlatformError> {
        let url = self.endpoint(path);
        let request = self
            .http
            .get(&url)
            .query(&[("raw_json", "1")])
            .query(query);
        self.execute(request, &url).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, PlatformError> {
        let url = self.endpoint(path);
        let request = self.http.post(&url).form(form);
        self.execute(request, &url).await
    }

    async fn info(&self, fullname: &str) -> Result<Submission, PlatformError> {
        let listing: Listing<Submission> = self.get_json("/api/info", &[("id", fullname)]).await?;
        listing
            .data
            .children
            .into_iter()
            .next()
            .map(|thing| thing.data)
            .ok_or_else(|| PlatformError::Decode(format!("no post {fullname}")))
    }

    async fn revision_authors(
        &self,
        community: &str,
        page: &str,
    ) -> Result<Vec<String>, PlatformError> {
        let path = format!("/r/{community}/wiki/revisions/{page}");
        let mut authors = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let mut query = vec![("limit", REVISIONS_PAGE)];
            if let Some(cursor) = after.as_deref() {
                query.push(("after", cursor));
            }
            let revisions: WikiRevisions = self.get_json(&path, &query).await?;
            authors.extend(
                revisions
                    .data
                    .children
                    .into_iter()
                    .map(|r| r.author.map(|a| a.data.name).unwrap_or_default()),
            );
            match revisions.data.after {
                Some(cursor) if !cursor.is_empty() => after = Some(cursor),
                _ => break,
            }
        }
        Ok(authors)
    }
}

impl Platform for RedditClient {
    #[instrument(level = "debug", skip(self))]
    async fn search_by_url(
        &self,
        community: &str,
        url: &str,
    ) -> Result<Vec<Submission>, PlatformError> {
        let query = format!("url:{url}");
        let listing: Listing<Submission> = self
            .get_json(
                &format!("/r/{community}/search"),
                &[
                    ("q", query.as_str()),
                    ("restrict_sr", "on"),
                    ("sort", "new"),
                    ("limit", SEARCH_LIMIT),
                    ("type", "link"),
                ],
            )
            .await?;
        Ok(listing.data.children.into_iter().map(|t| t.data).collect())
    }

    #[instrument(level = "info", skip(self, title))]
    async fn submit_link(
        &self,
        community: &str,
        title: &str,
        url: &str,
    ) -> Result<Submission, PlatformError> {
        let body: Value = self
            .post_form(
                "/api/submit",
                &[
                    ("sr", community),
                    ("kind", "link"),
                    ("title", title),
                    ("url", url),
                    ("resubmit", "false"),
                    ("sendreplies", "false"),
                    ("api_type", "json"),
                ],
            )
            .await?;
        let fullname = submitted_fullname(&body)?;
        self.info(&fullname).await
    }

    #[instrument(level = "info", skip(self, submission), fields(post = %submission.fullname()))]
    async fn add_to_collection(
        &self,
        collection_id: &str,
        submission: &Submission,
    ) -> Result<(), PlatformError> {
        let fullname = submission.fullname();
        let body: Value = self
            .post_form(
                "/api/v1/collections/add_post_to_collection",
                &[
                    ("collection_id", collection_id),
                    ("link_fullname", fullname.as_str()),
                ],
            )
            .await?;
        let errors = api_errors(&body);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PlatformError::Api(errors))
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn link_flair_templates(
        &self,
        community: &str,
    ) -> Result<Vec<FlairTemplate>, PlatformError> {
        self.get_json(&format!("/r/{community}/api/link_flair_v2"), &[])
            .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn wiki_page(&self, community: &str, page: &str) -> Result<WikiPage, PlatformError> {
        let document: WikiDocument = self
            .get_json(&format!("/r/{community}/wiki/{page}"), &[])
            .await?;
        let revision_authors = self.revision_authors(community, page).await?;
        if revision_authors.is_empty() {
            warn!(community, page, "Wiki page without revisions");
        }
        Ok(WikiPage {
            content_md: document.data.content_md,
            revision_authors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn already_submitted_is_structured() {
        let body = json!({"json": {"errors": [
            ["ALREADY_SUB", "that link has already been submitted", "url"]
        ]}});
        let err = submitted_fullname(&body).unwrap_err();
        assert!(err.is_already_submitted());
    }

    #[test]
    fn other_api_errors_are_not_duplicates() {
        let body = json!({"json": {"errors": [
            ["RATELIMIT", "you are doing that too much", "ratelimit"],
            ["NO_TEXT", "we need something here", null]
        ]}});
        let err = submitted_fullname(&body).unwrap_err();
        assert!(!err.is_already_submitted());
        match err {
            PlatformError::Api(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].field, None);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fullname_comes_from_name_or_id() {
        let named = json!({"json": {"errors": [], "data": {"name": "t3_abc", "id": "abc"}}});
        assert_eq!(submitted_fullname(&named).unwrap(), "t3_abc");
        let bare = json!({"json": {"errors": [], "data": {"id": "xyz"}}});
        assert_eq!(submitted_fullname(&bare).unwrap(), "t3_xyz");
        let empty = json!({"json": {"errors": []}});
        assert!(matches!(submitted_fullname(&empty), Err(PlatformError::Decode(_))));
    }

    #[test]
    fn status_classification() {
        assert!(classify(StatusCode::OK, "u").is_ok());
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, "u"),
            Err(PlatformError::Service { status: 502, .. })
        ));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, "u"),
            Err(PlatformError::Rejected { status: 403, .. })
        ));
    }

    #[test]
    fn listings_and_revisions_decode() {
        let listing: Listing<Submission> = decode(
            "u",
            r#"{"kind":"Listing","data":{"after":null,"children":[{"kind":"t3","data":{
                "id":"abc","permalink":"/r/hungary/comments/abc/cim/",
                "created_utc":1704153600.0,"url":"https://telex.hu/belfold/2024/01/01/cikk",
                "title":"Cím"}}]}}"#,
        )
        .unwrap();
        let post = &listing.data.children[0].data;
        assert_eq!(post.fullname(), "t3_abc");
        assert_eq!(post.created_utc, 1_704_153_600.0);

        let revisions: WikiRevisions = decode(
            "u",
            r#"{"kind":"Listing","data":{"after":null,"children":[
                {"id":"r1","author":{"kind":"t2","data":{"name":"owner"}}},
                {"id":"r2","author":null}]}}"#,
        )
        .unwrap();
        let authors: Vec<_> = revisions
            .data
            .children
            .into_iter()
            .map(|r| r.author.map(|a| a.data.name).unwrap_or_default())
            .collect();
        assert_eq!(authors, vec!["owner".to_string(), String::new()]);
    }
}
