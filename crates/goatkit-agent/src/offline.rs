//! The page served when neither the store nor the network can answer.

use goatkit_net::Response;

/// Build the offline page for `app_name`: `200 OK`, `text/html`.
pub fn offline_page(app_name: &str) -> Response {
    Response::html(render(app_name))
}

fn render(app_name: &str) -> String {
    let name = escape(app_name);
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>Offline - {name}</title>
    <style>
      body {{
        font-family: Arial, sans-serif;
        text-align: center;
        padding: 50px;
        background: #f5f7ff;
        color: #2d3436;
      }}
      h1 {{ color: #4a6ee0; }}
    </style>
  </head>
  <body>
    <h1>🐐 {name}</h1>
    <h2>You're Offline</h2>
    <p>Please check your internet connection and try again.</p>
    <button onclick="window.location.reload()">Retry</button>
  </body>
</html>
"#
    )
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn test_offline_page() {
        let response = offline_page("GOAT KIDS");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type().unwrap().essence_str(), "text/html");

        let body = response.text().unwrap();
        assert!(body.contains("<title>Offline - GOAT KIDS</title>"));
        assert!(body.contains("GOAT KIDS"));
        assert!(body.contains("You're Offline"));
        assert!(body.contains("window.location.reload()"));
    }

    #[test]
    fn test_app_name_is_escaped() {
        let body = offline_page("<Goats & Co>").text().unwrap();
        assert!(body.contains("&lt;Goats &amp; Co&gt;"));
        assert!(!body.contains("<Goats"));
    }
}
