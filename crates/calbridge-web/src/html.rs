//! HTML pages for the legacy API-key login flow.
//!
//! Every interpolated value goes through [`escape`].

/// Escape the five HTML-significant characters.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Page shown once after a successful login, carrying the new API key.
pub fn login_success(subject: &str, api_key: &str) -> String {
    let subject = escape(subject);
    let api_key = escape(api_key);
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Authentication Successful</title>
<style>
body {{ font-family: -apple-system, BlinkMacSystemFont, sans-serif; max-width: 600px; margin: 40px auto; padding: 20px; }}
.key-box {{ background: #f5f5f5; border: 1px solid #ddd; border-radius: 8px; padding: 16px; margin: 16px 0; word-break: break-all; font-family: monospace; }}
</style>
</head>
<body>
<h2>Authentication Successful</h2>
<p>Signed in as <strong>{subject}</strong></p>
<p>Your API key for MCP requests (shown only once):</p>
<div class="key-box" id="api-key">{api_key}</div>
<p>Send it as a bearer token:</p>
<pre>Authorization: Bearer {api_key}</pre>
<p>You can close this tab now.</p>
</body>
</html>"#
    )
}

/// Page shown when the user declined access upstream.
pub fn login_failed(reason: &str) -> String {
    format!(
        "<!DOCTYPE html><html><body><h2>Authentication failed</h2><p>{}</p></body></html>",
        escape(reason)
    )
}
