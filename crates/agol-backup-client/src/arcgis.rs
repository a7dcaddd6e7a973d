use agol_backup_core::catalog::Catalog;
use agol_backup_core::config::HttpConfig;
use agol_backup_core::error::AppError;
use agol_backup_core::models::{ExportJob, Item, JobStatus};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// Largest page the search endpoint serves.
const SEARCH_PAGE_SIZE: usize = 100;

/// Error body returned by the sharing API.
///
/// ArcGIS reports most failures with HTTP 200 and a body of the form:
/// ```json
/// {"error": {"code": 400, "message": "...", "details": []}}
/// ```
/// `details` may also be `null` or missing.
#[derive(Deserialize, Debug)]
struct ErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    details: Option<Vec<String>>,
}

/// Either an error envelope or the expected payload.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum ArcGisResponse<T> {
    Error { error: ErrorBody },
    Ok(T),
}

impl<T> ArcGisResponse<T> {
    fn into_result(self) -> Result<T, AppError> {
        match self {
            ArcGisResponse::Ok(value) => Ok(value),
            ArcGisResponse::Error { error } => {
                let details = error.details.unwrap_or_default();
                let message = if details.is_empty() {
                    error.message
                } else {
                    format!("{} ({})", error.message, details.join("; "))
                };
                Err(AppError::ApiError {
                    code: error.code,
                    message,
                })
            }
        }
    }
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    token: String,
    /// Expiry as epoch milliseconds.
    expires: i64,
}

/// One page of `sharing/rest/search` results.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    total: usize,
    /// 1-based index of the next page, or -1 when there is none.
    next_start: i64,
    results: Vec<Item>,
}

/// Start index of the page following `page`, or `None` once the listing is done.
///
/// `collected` counts the results gathered so far, `page` included.
fn next_page_start(page: &SearchPage, collected: usize, max_items: usize) -> Option<i64> {
    if collected >= max_items || page.results.is_empty() || page.next_start <= 0 {
        None
    } else {
        Some(page.next_start)
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    status_message: Option<String>,
}

impl StatusResponse {
    fn into_job_status(self) -> JobStatus {
        match self.status.as_str() {
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed(
                self.status_message
                    .unwrap_or_else(|| "export job failed".to_string()),
            ),
            _ => JobStatus::Processing,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    success: bool,
    item_id: Option<String>,
}

fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<T, AppError> {
    let parsed: ArcGisResponse<T> = serde_json::from_str(body)?;
    parsed.into_result()
}

/// Parses an item data body. Items without data return an empty body.
fn parse_data_body(body: &str) -> Result<Value, AppError> {
    if body.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    parse_envelope(body)
}

fn is_json_response(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("json"))
}

/// Sibling path a download is streamed into before it is renamed into place.
fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// HTTP client for the ArcGIS Online (or Enterprise portal) sharing REST API.
///
/// A value of this type is an authenticated session. When it was created with
/// [`ArcGisClient::connect`] it keeps the password, and a call rejected with an
/// expired token (codes 498/499) signs in again and is repeated once. Clones
/// share the session token.
///
/// # Examples
///
/// ```no_run
/// use agol_backup_client::ArcGisClient;
/// use agol_backup_core::{Catalog, HttpConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ArcGisClient::connect(
///     "https://www.arcgis.com",
///     "gis_admin",
///     "secret",
///     HttpConfig::default(),
/// )
/// .await?;
/// let items = client.search("owner:*", 1000).await?;
/// println!("Found {} items", items.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ArcGisClient {
    client: Client,
    base_url: Url,
    username: String,
    password: Option<String>,
    token: Arc<RwLock<String>>,
    config: HttpConfig,
}

impl std::fmt::Debug for ArcGisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArcGisClient")
            .field("base_url", &self.base_url.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ArcGisClient {
    /// Signs in to the portal and returns an authenticated client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUrl` if the portal URL is malformed.
    /// Returns `AppError::AuthenticationFailed` if the credentials are rejected.
    pub async fn connect(
        portal_url: &str,
        username: &str,
        password: &str,
        config: HttpConfig,
    ) -> Result<Self, AppError> {
        let mut client = Self::with_token(portal_url, username, "", config)?;
        client.password = Some(password.to_string());
        client.renew_token().await?;
        Ok(client)
    }

    /// Creates a client around an existing token.
    ///
    /// Without a password the token cannot be renewed; once it expires every
    /// call fails with `AppError::ApiError` code 498.
    pub fn with_token(
        portal_url: &str,
        username: &str,
        token: &str,
        config: HttpConfig,
    ) -> Result<Self, AppError> {
        let mut base_url = Url::parse(portal_url)
            .map_err(|_| AppError::InvalidUrl(portal_url.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::InvalidUrl(portal_url.to_string()));
        }
        // Url::join drops the last path segment unless it ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(concat!("agol-backup/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            username: username.to_string(),
            password: None,
            token: Arc::new(RwLock::new(token.to_string())),
            config,
        })
    }

    /// Resolves a path below the portal's `sharing/rest/` root.
    fn sharing_url(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join("sharing/rest/")
            .and_then(|root| root.join(path))
            .map_err(|e| AppError::InvalidUrl(e.to_string()))
    }

    fn token(&self) -> String {
        match self.token.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_token(&self, token: String) {
        match self.token.write() {
            Ok(mut current) => *current = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    /// Adds `f=json` and the session token to a GET URL.
    fn authorized(&self, mut url: Url) -> Url {
        let token = self.token();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("f", "json");
            if !token.is_empty() {
                pairs.append_pair("token", &token);
            }
        }
        url
    }

    async fn generate_token(&self, password: &str) -> Result<String, AppError> {
        let url = self.sharing_url("generateToken")?;
        let expiration = (self.config.token_expiration.as_secs() / 60).max(1).to_string();
        let referer = self.base_url.as_str();
        let form = [
            ("username", self.username.as_str()),
            ("password", password),
            ("client", "referer"),
            ("referer", referer),
            ("expiration", expiration.as_str()),
            ("f", "json"),
        ];

        let resp = self.send_once(self.client.post(url.clone()).form(&form), &url).await?;
        let body = resp
            .text()
            .await
            .map_err(|e| self.map_send_error(e, self.config.timeout))?;

        match parse_envelope::<TokenResponse>(&body) {
            Ok(token) => {
                debug!("Signed in as {} (token expires {})", self.username, token.expires);
                Ok(token.token)
            }
            Err(AppError::ApiError { message, .. }) => Err(AppError::AuthenticationFailed(message)),
            Err(e) => Err(e),
        }
    }

    /// Signs in again with the stored password and replaces the session token.
    async fn renew_token(&self) -> Result<(), AppError> {
        let Some(password) = self.password.as_deref() else {
            return Err(AppError::AuthenticationFailed(
                "no password available to renew the session token".to_string(),
            ));
        };
        let token = self.generate_token(password).await?;
        self.set_token(token);
        Ok(())
    }

    fn can_renew(&self, err: &AppError) -> bool {
        err.is_token_expired() && self.password.is_some()
    }

    async fn renew_after(&self, err: &AppError) -> Result<(), AppError> {
        warn!("{}; signing in again", err);
        self.renew_token().await
    }

    /// Maps the HTTP status of a response to an error.
    fn check_status(resp: reqwest::Response, url: &Url) -> Result<reqwest::Response, AppError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Err(AppError::RateLimitExceeded)
        } else if status.is_server_error() {
            Err(AppError::ServerError(status.as_u16()))
        } else {
            Err(AppError::ClientError(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url.path()
            )))
        }
    }

    fn map_send_error(&self, e: reqwest::Error, timeout: Duration) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(timeout.as_secs())
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {}", e.without_url()))
        } else {
            AppError::ClientError(e.without_url().to_string())
        }
    }

    /// Sends a single request and checks the HTTP status.
    async fn send_once(
        &self,
        request: RequestBuilder,
        url: &Url,
    ) -> Result<reqwest::Response, AppError> {
        let resp = request
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.config.timeout))?;
        Self::check_status(resp, url)
    }

    /// Makes an HTTP GET request with automatic retry on transient failures.
    ///
    /// Errors for which [`AppError::is_retryable`] holds (network errors,
    /// timeouts, 5xx and 429) are retried up to `max_retries` attempts in
    /// total. Rate limiting backs off exponentially, everything else linearly.
    async fn get_with_retry(
        &self,
        url: &Url,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, AppError> {
        let max_attempts = self.config.max_retries.max(1);
        let base_delay = self.config.retry_base_delay;
        let timeout = timeout.unwrap_or(self.config.timeout);
        let mut attempt = 1;

        loop {
            let request = self.client.get(url.clone()).timeout(timeout);
            let err = match request.send().await {
                Ok(resp) => match Self::check_status(resp, url) {
                    Ok(resp) => return Ok(resp),
                    Err(e) => e,
                },
                Err(e) => self.map_send_error(e, timeout),
            };

            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            let delay = match err {
                AppError::RateLimitExceeded => base_delay * 2_u32.pow(attempt),
                _ => base_delay * attempt,
            };
            debug!(
                "GET {} failed ({}), attempt {}/{}; retrying in {:?}",
                url.path(),
                err,
                attempt,
                max_attempts,
                delay
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn get_parsed_once<T>(
        &self,
        url: &Url,
        parse: fn(&str) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let url = self.authorized(url.clone());
        let resp = self.get_with_retry(&url, None).await?;
        let body = resp
            .text()
            .await
            .map_err(|e| self.map_send_error(e, self.config.timeout))?;
        parse(&body)
    }

    /// GETs `url` with the session token and parses the body with `parse`.
    async fn get_parsed<T>(
        &self,
        url: &Url,
        parse: fn(&str) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        match self.get_parsed_once(url, parse).await {
            Err(e) if self.can_renew(&e) => {
                self.renew_after(&e).await?;
                self.get_parsed_once(url, parse).await
            }
            other => other,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, AppError> {
        self.get_parsed(&url, parse_envelope::<T>).await
    }

    async fn post_json_once<T: DeserializeOwned>(
        &self,
        url: &Url,
        params: &[(&str, &str)],
    ) -> Result<T, AppError> {
        let token = self.token();
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("f", "json"));
        form.push(("token", token.as_str()));

        let resp = self
            .send_once(self.client.post(url.clone()).form(&form), url)
            .await?;
        let body = resp
            .text()
            .await
            .map_err(|e| self.map_send_error(e, self.config.timeout))?;
        parse_envelope(&body)
    }

    /// POSTs a form. Sent once, apart from a single repeat after renewing an
    /// expired token, since the portal rejected the first attempt outright.
    async fn post_json<T: DeserializeOwned>(
        &self,
        url: Url,
        params: &[(&str, &str)],
    ) -> Result<T, AppError> {
        match self.post_json_once(&url, params).await {
            Err(e) if self.can_renew(&e) => {
                self.renew_after(&e).await?;
                self.post_json_once(&url, params).await
            }
            other => other,
        }
    }

    /// Streams a response body into `path`, returning the number of bytes written.
    async fn write_body(&self, mut resp: reqwest::Response, path: &Path) -> Result<u64, AppError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| self.map_send_error(e, self.config.download_timeout))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Downloads an item's file to `path` through a `.part` file.
    ///
    /// Nothing is left at either path when the transfer fails.
    async fn download_once(&self, item_id: &str, path: &Path) -> Result<u64, AppError> {
        let mut url = self.sharing_url(&format!("content/items/{}/data", item_id))?;
        let token = self.token();
        if !token.is_empty() {
            url.query_pairs_mut().append_pair("token", &token);
        }

        let resp = self
            .get_with_retry(&url, Some(self.config.download_timeout))
            .await?;
        if is_json_response(&resp) {
            let body = resp
                .text()
                .await
                .map_err(|e| self.map_send_error(e, self.config.download_timeout))?;
            parse_envelope::<Value>(&body)?;
            return Err(AppError::ClientError(format!(
                "expected a file for item {}, got a JSON document",
                item_id
            )));
        }

        let part = part_path(path);
        let result = match self.write_body(resp, &part).await {
            Ok(written) => tokio::fs::rename(&part, path)
                .await
                .map(|()| written)
                .map_err(AppError::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(cleanup) = tokio::fs::remove_file(&part).await {
                debug!("Could not remove {}: {}", part.display(), cleanup);
            }
        }
        result
    }

    fn user_content_path(&self, user: &str, rest: &str) -> String {
        format!("content/users/{}/{}", user, rest)
    }
}

#[async_trait]
impl Catalog for ArcGisClient {
    async fn search(&self, query: &str, max_items: usize) -> Result<Vec<Item>, AppError> {
        let mut items = Vec::new();
        let mut start: i64 = 1;

        while items.len() < max_items {
            let num = SEARCH_PAGE_SIZE.min(max_items - items.len());
            let mut url = self.sharing_url("search")?;
            url.query_pairs_mut()
                .append_pair("q", query)
                .append_pair("num", &num.to_string())
                .append_pair("start", &start.to_string());

            let page: SearchPage = self.get_json(url).await?;
            debug!(
                "Search '{}' page at {}: {} of {} results",
                query,
                start,
                page.results.len(),
                page.total
            );

            let next = next_page_start(&page, items.len() + page.results.len(), max_items);
            items.extend(page.results);
            match next {
                Some(next) => start = next,
                None => break,
            }
        }

        items.truncate(max_items);
        Ok(items)
    }

    async fn get_item(&self, id: &str) -> Result<Item, AppError> {
        let url = self.sharing_url(&format!("content/items/{}", id))?;
        self.get_json(url).await
    }

    async fn get_data(&self, item: &Item) -> Result<Value, AppError> {
        let url = self.sharing_url(&format!("content/items/{}/data", item.id))?;
        self.get_parsed(&url, parse_data_body).await
    }

    async fn export(
        &self,
        item: &Item,
        title: &str,
        format: &str,
    ) -> Result<ExportJob, AppError> {
        let url = self.sharing_url(&self.user_content_path(&self.username, "export"))?;
        self.post_json(
            url,
            &[
                ("itemId", item.id.as_str()),
                ("title", title),
                ("exportFormat", format),
            ],
        )
        .await
    }

    async fn job_status(&self, job: &ExportJob) -> Result<JobStatus, AppError> {
        let path = self.user_content_path(
            &self.username,
            &format!("items/{}/status", job.export_item_id),
        );
        let mut url = self.sharing_url(&path)?;
        url.query_pairs_mut()
            .append_pair("jobId", &job.job_id)
            .append_pair("jobType", "export");

        let status: StatusResponse = self.get_json(url).await?;
        Ok(status.into_job_status())
    }

    async fn download(
        &self,
        item: &Item,
        dir: &Path,
        file_name: &str,
    ) -> Result<PathBuf, AppError> {
        let path = dir.join(file_name);
        let written = match self.download_once(&item.id, &path).await {
            Err(e) if self.can_renew(&e) => {
                self.renew_after(&e).await?;
                self.download_once(&item.id, &path).await?
            }
            other => other?,
        };
        debug!("Downloaded {} bytes to {}", written, path.display());
        Ok(path)
    }

    async fn delete(&self, item: &Item) -> Result<(), AppError> {
        let owner = item.owner().unwrap_or(&self.username);
        let path = self.user_content_path(owner, &format!("items/{}/delete", item.id));
        let url = self.sharing_url(&path)?;

        let resp: DeleteResponse = self.post_json(url, &[]).await?;
        if !resp.success {
            return Err(AppError::Generic(format!(
                "Portal refused to delete item {}",
                resp.item_id.as_deref().unwrap_or(&item.id)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agol_backup_core::models::ItemType;

    fn client(portal: &str) -> ArcGisClient {
        ArcGisClient::with_token(portal, "gis_admin", "tok123", HttpConfig::default()).unwrap()
    }

    #[test]
    fn test_new_with_valid_url() {
        let client = client("https://www.arcgis.com");
        assert_eq!(client.base_url.as_str(), "https://www.arcgis.com/");
    }

    #[test]
    fn test_new_with_invalid_url() {
        let result =
            ArcGisClient::with_token("not-a-valid-url", "u", "", HttpConfig::default());
        assert!(matches!(result, Err(AppError::InvalidUrl(_))));
    }

    #[test]
    fn test_sharing_url_keeps_portal_path() {
        let client = client("https://gis.example.org/portal");
        let url = client.sharing_url("search").unwrap();
        assert_eq!(url.as_str(), "https://gis.example.org/portal/sharing/rest/search");
    }

    #[test]
    fn test_user_content_urls() {
        let client = client("https://www.arcgis.com");
        let path = client.user_content_path("gis_admin", "items/abc/delete");
        let url = client.sharing_url(&path).unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.arcgis.com/sharing/rest/content/users/gis_admin/items/abc/delete"
        );
    }

    #[test]
    fn test_authorized_appends_format_and_token() {
        let client = client("https://www.arcgis.com");
        let url = client.authorized(client.sharing_url("content/items/abc").unwrap());
        assert_eq!(url.query(), Some("f=json&token=tok123"));
    }

    #[test]
    fn test_debug_hides_token() {
        let client = client("https://www.arcgis.com");
        let debug = format!("{:?}", client);
        assert!(debug.contains("gis_admin"));
        assert!(!debug.contains("tok123"));
    }

    #[test]
    fn test_error_envelope_maps_to_api_error() {
        let json = r#"{
            "error": {
                "code": 400,
                "message": "Unable to generate token.",
                "details": ["Invalid username or password."]
            }
        }"#;
        let parsed: ArcGisResponse<TokenResponse> = serde_json::from_str(json).unwrap();
        match parsed.into_result() {
            Err(AppError::ApiError { code, message }) => {
                assert_eq!(code, 400);
                assert!(message.contains("Invalid username or password."));
            }
            other => panic!("Expected ApiError, got {:?}", other.map(|t| t.token)),
        }
    }

    #[test]
    fn test_error_envelope_with_null_details() {
        let json = r#"{"error": {"code": 498, "message": "Invalid token.", "details": null}}"#;
        let err = parse_data_body(json).unwrap_err();
        match err {
            AppError::ApiError { code, ref message } => {
                assert_eq!(code, 498);
                assert_eq!(message, "Invalid token.");
            }
            ref other => panic!("Expected ApiError, got {:?}", other),
        }
        assert!(err.is_token_expired());
    }

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{"token": "abc.def", "expires": 1717171717000, "ssl": true}"#;
        let parsed: ArcGisResponse<TokenResponse> = serde_json::from_str(json).unwrap();
        let token = parsed.into_result().unwrap();
        assert_eq!(token.token, "abc.def");
        assert_eq!(token.expires, 1717171717000);
    }

    #[test]
    fn test_search_page_deserialization() {
        let json = r#"{
            "query": "owner:*",
            "total": 2,
            "start": 1,
            "num": 100,
            "nextStart": -1,
            "results": [
                {"id": "a", "owner": "bob", "title": "Roads", "type": "Feature Service",
                 "typeKeywords": ["Data", "Service"]},
                {"id": "b", "owner": "bob", "title": "Ops", "type": "Dashboard",
                 "typeKeywords": []}
            ]
        }"#;
        let page: SearchPage = serde_json::from_str::<ArcGisResponse<SearchPage>>(json)
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.next_start, -1);
        assert_eq!(page.results[0].item_type, ItemType::FeatureService);
        assert_eq!(page.results[1].item_type, ItemType::Dashboard);
    }

    fn page(next_start: i64, results: usize) -> SearchPage {
        SearchPage {
            total: 250,
            next_start,
            results: (0..results)
                .map(|n| Item::new(format!("item-{}", n), "Roads", ItemType::WebMap))
                .collect(),
        }
    }

    #[test]
    fn test_next_page_start_follows_pages_to_terminator() {
        let pages = [page(101, 100), page(201, 100), page(-1, 50)];
        let mut collected = 0;
        let mut starts = Vec::new();
        for p in &pages {
            collected += p.results.len();
            starts.push(next_page_start(p, collected, 1000));
        }
        assert_eq!(starts, vec![Some(101), Some(201), None]);
        assert_eq!(collected, 250);
    }

    #[test]
    fn test_next_page_start_stops_at_cap_and_empty_page() {
        assert_eq!(next_page_start(&page(101, 100), 100, 100), None);
        assert_eq!(next_page_start(&page(101, 100), 100, 150), Some(101));
        assert_eq!(next_page_start(&page(101, 0), 0, 1000), None);
        assert_eq!(next_page_start(&page(0, 100), 100, 1000), None);
    }

    #[test]
    fn test_part_path_appends_suffix() {
        let path = part_path(Path::new("/backups/20240601-Roads.zip"));
        assert_eq!(path, PathBuf::from("/backups/20240601-Roads.zip.part"));
    }

    #[test]
    fn test_export_job_response() {
        let json = r#"{"type": "File Geodatabase", "size": 0,
                       "jobId": "j1", "exportItemId": "e1"}"#;
        let job: ExportJob = serde_json::from_str::<ArcGisResponse<ExportJob>>(json)
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(job.job_id, "j1");
        assert_eq!(job.export_item_id, "e1");
    }

    #[test]
    fn test_status_mapping() {
        let status = |s: &str, msg: Option<&str>| {
            StatusResponse {
                status: s.to_string(),
                status_message: msg.map(str::to_string),
            }
            .into_job_status()
        };
        assert_eq!(status("completed", None), JobStatus::Completed);
        assert_eq!(status("processing", None), JobStatus::Processing);
        assert_eq!(status("partial", None), JobStatus::Processing);
        assert_eq!(
            status("failed", Some("Layer has no records")),
            JobStatus::Failed("Layer has no records".to_string())
        );
        assert_eq!(
            status("failed", None),
            JobStatus::Failed("export job failed".to_string())
        );
    }

    #[test]
    fn test_parse_data_body() {
        assert_eq!(parse_data_body("").unwrap(), Value::Object(Map::new()));
        assert_eq!(parse_data_body("  \n").unwrap(), Value::Object(Map::new()));

        let data = parse_data_body(r#"{"operationalLayers": [], "version": "2.31"}"#).unwrap();
        assert_eq!(data["version"], "2.31");

        let err = parse_data_body(r#"{"error": {"code": 403, "message": "No access"}}"#)
            .unwrap_err();
        assert!(matches!(err, AppError::ApiError { code: 403, .. }));
    }

    #[test]
    fn test_delete_response_deserialization() {
        let json = r#"{"success": true, "itemId": "abc"}"#;
        let resp: DeleteResponse = serde_json::from_str(json).unwrap();
        assert!(resp.success);
        assert_eq!(resp.item_id.as_deref(), Some("abc"));
    }

    mod fake_portal {
        //! A local portal stand-in served by axum, for exercising the HTTP paths.

        use super::*;
        use axum::body::Body;
        use axum::extract::State;
        use axum::http::{header, Method, StatusCode as HttpStatus, Uri};
        use axum::response::{IntoResponse, Response};
        use axum::{Json, Router};
        use serde_json::json;
        use std::collections::{HashMap, VecDeque};
        use std::sync::Mutex;
        use tempfile::TempDir;
        use tokio::net::TcpListener;

        const PASSWORD: &str = "secret";
        const TOTAL_ITEMS: usize = 250;

        #[derive(Default)]
        struct PortalState {
            tokens_issued: usize,
            valid_token: String,
            requests: Vec<String>,
            /// Statuses returned, in order, before normal handling resumes.
            fail_next: VecDeque<u16>,
        }

        type Shared = Arc<Mutex<PortalState>>;

        fn package_bytes() -> Vec<u8> {
            let mut bytes = b"PK\x03\x04".to_vec();
            bytes.extend(std::iter::repeat(7u8).take(64 * 1024));
            bytes
        }

        fn respond(
            state: &mut PortalState,
            method: &Method,
            path: &str,
            params: &HashMap<String, String>,
        ) -> Response {
            state.requests.push(format!("{} {}", method, path));
            if let Some(code) = state.fail_next.pop_front() {
                return HttpStatus::from_u16(code)
                    .unwrap_or(HttpStatus::INTERNAL_SERVER_ERROR)
                    .into_response();
            }

            if path.ends_with("/generateToken") {
                if params.get("password").map(String::as_str) != Some(PASSWORD) {
                    return Json(json!({"error": {
                        "code": 400,
                        "message": "Unable to generate token.",
                        "details": ["Invalid username or password."]
                    }}))
                    .into_response();
                }
                state.tokens_issued += 1;
                state.valid_token = format!("tok-{}", state.tokens_issued);
                return Json(json!({"token": state.valid_token, "expires": 1}))
                    .into_response();
            }

            if params.get("token") != Some(&state.valid_token) {
                return Json(json!({"error": {
                    "code": 498,
                    "message": "Invalid token.",
                    "details": null
                }}))
                .into_response();
            }

            match path {
                "/sharing/rest/search" => {
                    let start: usize = params
                        .get("start")
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(1);
                    let num: usize = params.get("num").and_then(|s| s.parse().ok()).unwrap_or(10);
                    let end = (start - 1 + num).min(TOTAL_ITEMS);
                    let results: Vec<Value> = (start..=end)
                        .map(|n| json!({"id": format!("item-{}", n), "title": format!("Map {}", n), "type": "Web Map"}))
                        .collect();
                    let next_start = if end < TOTAL_ITEMS { end as i64 + 1 } else { -1 };
                    Json(json!({
                        "total": TOTAL_ITEMS,
                        "start": start,
                        "num": num,
                        "nextStart": next_start,
                        "results": results
                    }))
                    .into_response()
                }
                "/sharing/rest/content/items/abc" => {
                    Json(json!({"id": "abc", "title": "Roads", "type": "Feature Service"}))
                        .into_response()
                }
                "/sharing/rest/content/items/pkg/data" => (
                    [(header::CONTENT_TYPE, "application/x-zip-compressed")],
                    Body::from(package_bytes()),
                )
                    .into_response(),
                "/sharing/rest/content/items/locked/data" => Json(json!({"error": {
                    "code": 403,
                    "message": "You do not have permissions to access this resource or perform this operation.",
                    "details": []
                }}))
                .into_response(),
                "/sharing/rest/content/users/gis_admin/items/pkg/delete" => {
                    Json(json!({"success": true, "itemId": "pkg"})).into_response()
                }
                _ => HttpStatus::NOT_FOUND.into_response(),
            }
        }

        async fn handle(
            State(state): State<Shared>,
            method: Method,
            uri: Uri,
            body: String,
        ) -> Response {
            let mut params: HashMap<String, String> = uri
                .query()
                .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
                .unwrap_or_default();
            params.extend(url::form_urlencoded::parse(body.as_bytes()).into_owned());

            let mut state = state.lock().unwrap();
            respond(&mut state, &method, uri.path(), &params)
        }

        async fn start_portal() -> (String, Shared) {
            let state: Shared = Arc::new(Mutex::new(PortalState::default()));
            let app = Router::new().fallback(handle).with_state(state.clone());
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{}", addr), state)
        }

        fn fast_config() -> HttpConfig {
            HttpConfig {
                max_retries: 3,
                retry_base_delay: Duration::from_millis(1),
                ..HttpConfig::default()
            }
        }

        async fn connected() -> (ArcGisClient, Shared) {
            let (portal, state) = start_portal().await;
            let client = ArcGisClient::connect(&portal, "gis_admin", PASSWORD, fast_config())
                .await
                .unwrap();
            (client, state)
        }

        fn expire_token(state: &Shared) {
            state.lock().unwrap().valid_token = "tok-revoked".to_string();
        }

        fn requests(state: &Shared) -> Vec<String> {
            state.lock().unwrap().requests.clone()
        }

        fn package() -> Item {
            Item::new("pkg", "20240601-Roads", ItemType::from("File Geodatabase"))
                .with_field("owner", json!("gis_admin"))
        }

        #[tokio::test]
        async fn test_connect_rejects_bad_password() {
            let (portal, _state) = start_portal().await;
            let result =
                ArcGisClient::connect(&portal, "gis_admin", "wrong", fast_config()).await;
            match result {
                Err(AppError::AuthenticationFailed(message)) => {
                    assert!(message.contains("Invalid username or password."))
                }
                other => panic!("Expected AuthenticationFailed, got {:?}", other.map(|_| ())),
            }
        }

        #[tokio::test]
        async fn test_expired_token_is_renewed_once() {
            let (client, state) = connected().await;
            expire_token(&state);

            let item = client.get_item("abc").await.unwrap();

            assert_eq!(item.title, "Roads");
            assert_eq!(state.lock().unwrap().tokens_issued, 2);
            assert_eq!(
                requests(&state),
                vec![
                    "POST /sharing/rest/generateToken",
                    "GET /sharing/rest/content/items/abc",
                    "POST /sharing/rest/generateToken",
                    "GET /sharing/rest/content/items/abc",
                ]
            );
        }

        #[tokio::test]
        async fn test_expired_token_is_renewed_for_posts() {
            let (client, state) = connected().await;
            expire_token(&state);

            client.delete(&package()).await.unwrap();
            assert_eq!(state.lock().unwrap().tokens_issued, 2);
        }

        #[tokio::test]
        async fn test_expired_token_without_password_fails() {
            let (portal, state) = start_portal().await;
            let client =
                ArcGisClient::with_token(&portal, "gis_admin", "stale", fast_config()).unwrap();

            let err = client.get_item("abc").await.unwrap_err();

            assert!(err.is_token_expired());
            assert_eq!(state.lock().unwrap().tokens_issued, 0);
            assert_eq!(requests(&state), vec!["GET /sharing/rest/content/items/abc"]);
        }

        #[tokio::test]
        async fn test_search_follows_next_start_across_pages() {
            let (client, state) = connected().await;

            let items = client.search("owner:*", 1000).await.unwrap();

            assert_eq!(items.len(), TOTAL_ITEMS);
            assert_eq!(items[0].id, "item-1");
            assert_eq!(items[TOTAL_ITEMS - 1].id, "item-250");
            let searches = requests(&state)
                .iter()
                .filter(|r| r.ends_with("/search"))
                .count();
            assert_eq!(searches, 3);
        }

        #[tokio::test]
        async fn test_search_stops_at_max_items() {
            let (client, state) = connected().await;

            let items = client.search("owner:*", 150).await.unwrap();

            assert_eq!(items.len(), 150);
            assert_eq!(items[149].id, "item-150");
            let searches = requests(&state)
                .iter()
                .filter(|r| r.ends_with("/search"))
                .count();
            assert_eq!(searches, 2);
        }

        #[tokio::test]
        async fn test_server_errors_are_retried() {
            let (client, state) = connected().await;
            state.lock().unwrap().fail_next.extend([503, 502]);

            let item = client.get_item("abc").await.unwrap();
            assert_eq!(item.id, "abc");
            assert_eq!(
                requests(&state)
                    .iter()
                    .filter(|r| r.ends_with("/items/abc"))
                    .count(),
                3
            );
        }

        #[tokio::test]
        async fn test_server_errors_give_up_after_max_retries() {
            let (client, state) = connected().await;
            state.lock().unwrap().fail_next.extend([500, 500, 500, 500]);

            let err = client.get_item("abc").await.unwrap_err();
            assert!(matches!(err, AppError::ServerError(500)));
            assert_eq!(state.lock().unwrap().fail_next.len(), 1);
        }

        #[tokio::test]
        async fn test_client_errors_are_not_retried() {
            let (client, state) = connected().await;
            state.lock().unwrap().fail_next.push_back(404);

            let err = client.get_item("abc").await.unwrap_err();
            assert!(matches!(err, AppError::ClientError(ref m) if m.contains("HTTP 404")));
            assert_eq!(
                requests(&state)
                    .iter()
                    .filter(|r| r.ends_with("/items/abc"))
                    .count(),
                1
            );
        }

        #[tokio::test]
        async fn test_download_streams_package_to_file() {
            let (client, state) = connected().await;
            let dir = TempDir::new().unwrap();

            let path = client
                .download(&package(), dir.path(), "20240601-Roads.zip")
                .await
                .unwrap();

            assert_eq!(path, dir.path().join("20240601-Roads.zip"));
            assert_eq!(std::fs::read(&path).unwrap(), package_bytes());
            assert!(!part_path(&path).exists());

            client.delete(&package()).await.unwrap();
            assert_eq!(
                requests(&state).last().map(String::as_str),
                Some("POST /sharing/rest/content/users/gis_admin/items/pkg/delete")
            );
        }

        #[tokio::test]
        async fn test_download_renews_expired_token() {
            let (client, state) = connected().await;
            expire_token(&state);
            let dir = TempDir::new().unwrap();

            let path = client
                .download(&package(), dir.path(), "20240601-Roads.zip")
                .await
                .unwrap();

            assert_eq!(std::fs::read(&path).unwrap().len(), package_bytes().len());
            assert_eq!(state.lock().unwrap().tokens_issued, 2);
        }

        #[tokio::test]
        async fn test_download_error_envelope_leaves_no_file() {
            let (client, _state) = connected().await;
            let dir = TempDir::new().unwrap();
            let locked = Item::new("locked", "20240601-Roads", ItemType::from("File Geodatabase"));

            let err = client
                .download(&locked, dir.path(), "20240601-Roads.zip")
                .await
                .unwrap_err();

            assert!(matches!(err, AppError::ApiError { code: 403, .. }));
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        }

        #[tokio::test]
        async fn test_failed_download_leaves_no_file() {
            let (client, state) = connected().await;
            state.lock().unwrap().fail_next.extend([500, 500, 500]);
            let dir = TempDir::new().unwrap();

            let err = client
                .download(&package(), dir.path(), "20240601-Roads.zip")
                .await
                .unwrap_err();

            assert!(matches!(err, AppError::ServerError(500)));
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        }

        #[tokio::test]
        async fn test_item_data_renews_expired_token() {
            let (client, state) = connected().await;
            expire_token(&state);

            // The fake serves no data for "abc", so the retried call ends in a 404.
            let err = client
                .get_data(&Item::new("abc", "Roads", ItemType::FeatureService))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::ClientError(ref m) if m.contains("HTTP 404")));
            assert_eq!(state.lock().unwrap().tokens_issued, 2);
        }
    }
}
