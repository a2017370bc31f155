//! Origin model and same-origin checks.

use url::Url;

/// Schemes whose URLs never share an origin with a web page.
const OPAQUE_SCHEMES: &[&str] = &[
    "data",
    "file",
    "javascript",
    "about",
    "chrome-extension",
    "moz-extension",
    "safari-web-extension",
];

/// A web origin (scheme + host + port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A tuple origin (scheme, host, port).
    Tuple {
        scheme: String,
        host: String,
        port: Option<u16>,
    },
    /// An opaque origin (unique, cannot match anything).
    Opaque(String),
}

impl Origin {
    /// Create an origin from a URL.
    pub fn from_url(url: &Url) -> Self {
        if OPAQUE_SCHEMES.contains(&url.scheme()) {
            return Origin::Opaque(url.to_string());
        }

        // blob: URLs inherit origin from their creator
        if url.scheme() == "blob" {
            return match Url::parse(url.path()) {
                Ok(inner) => Origin::from_url(&inner),
                Err(_) => Origin::Opaque(url.to_string()),
            };
        }

        match url.host_str() {
            Some(host) => Origin::Tuple {
                scheme: url.scheme().to_string(),
                host: host.to_ascii_lowercase(),
                port: url.port_or_known_default(),
            },
            None => Origin::Opaque(url.to_string()),
        }
    }

    /// Check if two origins are the same.
    pub fn same_origin(&self, other: &Origin) -> bool {
        match (self, other) {
            (
                Origin::Tuple { scheme: s1, host: h1, port: p1 },
                Origin::Tuple { scheme: s2, host: h2, port: p2 },
            ) => s1 == s2 && h1 == h2 && p1 == p2,
            // Opaque origins are never same-origin (even with themselves)
            _ => false,
        }
    }

    /// Check whether `url` belongs to this origin.
    pub fn contains(&self, url: &Url) -> bool {
        self.same_origin(&Origin::from_url(url))
    }

    /// Check if this is an opaque origin.
    pub fn is_opaque(&self) -> bool {
        matches!(self, Origin::Opaque(_))
    }

    /// Serialize to string (for logs and the Origin header).
    pub fn serialize(&self) -> String {
        match self {
            Origin::Tuple { scheme, host, port } => {
                let default_port = match scheme.as_str() {
                    "http" | "ws" => Some(80),
                    "https" | "wss" => Some(443),
                    _ => None,
                };
                match port {
                    Some(p) if *port != default_port => format!("{}://{}:{}", scheme, host, p),
                    _ => format!("{}://{}", scheme, host),
                }
            }
            Origin::Opaque(_) => "null".to_string(),
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialize())
    }
}
