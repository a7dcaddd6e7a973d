use thiserror::Error;

/// Application-wide error types.
///
/// This enum represents all possible errors that can occur while backing up a
/// catalog. It uses the `thiserror` crate for ergonomic error handling and
/// automatic conversion from underlying library errors.
///
/// # Error Conversion
///
/// Some errors automatically convert from their source types using the `#[from]` attribute:
/// - `serde_json::Error` → `AppError::SerializationError`
/// - `std::io::Error` → `AppError::Io`
///
/// # Examples
///
/// ```no_run
/// use agol_backup_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::Generic("Something went wrong".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP client request failed.
    ///
    /// This error occurs when HTTP requests fail due to network issues,
    /// unexpected status codes, or malformed response bodies.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// The portal rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The portal answered with an error envelope.
    ///
    /// ArcGIS reports most failures as HTTP 200 with an `{"error": {...}}` body.
    #[error("ArcGIS API error {code}: {message}")]
    ApiError { code: i64, message: String },

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Local filesystem operation failed.
    ///
    /// Raised when writing snapshots or downloaded packages into the output
    /// directory fails (disk full, permissions, invalid characters in a title).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The portal reported that an export job failed.
    #[error("Export of {item} failed: {message}")]
    ExportFailed { item: String, message: String },

    /// An export job did not complete within the wait window.
    #[error("Export of {item} did not complete within {secs} seconds")]
    ExportTimeout { item: String, secs: u64 },

    /// The portal answered with a 5xx status.
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Network or connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic application error for cases not covered by specific variants.
    ///
    /// Use this sparingly - prefer creating specific error variants
    /// for better error handling and debugging.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::AuthenticationFailed(msg) => {
                format!(
                    "Could not sign in to the portal: {}\n   Check AGOL_USERNAME and AGOL_PASSWORD.",
                    msg
                )
            }
            AppError::ClientError(msg) => {
                if msg.contains("timeout") || msg.contains("timed out") {
                    "Request timed out. The portal may be slow or unreachable.\n   Try again later or check the portal URL.".to_string()
                } else if msg.contains("connect") {
                    format!("Cannot connect to portal: {}\n   Check your internet connection and the portal URL.", msg)
                } else {
                    format!("API error: {}", msg)
                }
            }
            AppError::ApiError { code, message } => {
                if *code == 498 || *code == 499 {
                    "The portal token is invalid or expired.\n   Re-run the backup to sign in again."
                        .to_string()
                } else if *code == 403 {
                    format!(
                        "Permission denied: {}\n   The account may not own this item.",
                        message
                    )
                } else {
                    format!("ArcGIS error {}: {}", code, message)
                }
            }
            AppError::Io(e) => {
                format!("Cannot write backup files: {}\n   Check the output directory and free disk space.", e)
            }
            AppError::InvalidUrl(url) => {
                format!("Invalid portal URL: {}\n   Example: https://www.arcgis.com", url)
            }
            AppError::ExportTimeout { item, secs } => {
                format!(
                    "Export of {} was still running after {} seconds.\n   Raise --export-timeout or try again later.",
                    item, secs
                )
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!("Request timed out after {} seconds.\n   The server may be overloaded. Try again later.", secs)
            }
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use agol_backup_core::error::AppError;
    ///
    /// let err = AppError::NetworkError("connection reset".to_string());
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::AuthenticationFailed("bad password".to_string());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ServerError(_)
        )
    }

    /// Returns true if the portal rejected the session token (codes 498/499).
    ///
    /// # Examples
    ///
    /// ```
    /// use agol_backup_core::error::AppError;
    ///
    /// let err = AppError::ApiError { code: 498, message: "Invalid token.".to_string() };
    /// assert!(err.is_token_expired());
    /// ```
    pub fn is_token_expired(&self) -> bool {
        matches!(self, AppError::ApiError { code: 498 | 499, .. })
    }
}
