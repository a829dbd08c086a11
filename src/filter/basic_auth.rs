use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hyper::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use serde::Deserialize;
use serde_yaml::Value;
use std::sync::Arc;

use super::Filter;
use crate::context::RequestCtx;
use crate::error::FasthttpdResult;

pub const DEFAULT_REALM: &str = "Restricted";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BasicAuthConfig {
    realm: String,
    users: Vec<BasicAuthUser>,
    users_file: String,
}

impl Default for BasicAuthConfig {
    fn default() -> Self {
        Self {
            realm: DEFAULT_REALM.to_string(),
            users: Vec::new(),
            users_file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BasicAuthUser {
    name: String,
    secret: String,
}

/// Challenges requests with `WWW-Authenticate: Basic` and matches the
/// Authorization header against prepared credentials. Secrets are encoded
/// into the comparison form at construction and not retained.
pub struct BasicAuth {
    realm: String,
    users: Vec<PreparedUser>,
}

struct PreparedUser {
    name: String,
    auth: Vec<u8>,
}

impl BasicAuth {
    pub fn new(cfg: &Value) -> FasthttpdResult<Self> {
        let mut config: BasicAuthConfig = serde_yaml::from_value(cfg.clone())?;
        if !config.users_file.is_empty() {
            let data = std::fs::read_to_string(&config.users_file)?;
            let users: Vec<BasicAuthUser> = serde_yaml::from_str(&data)?;
            config.users.extend(users);
        }
        let users = config
            .users
            .into_iter()
            .map(|u| PreparedUser {
                auth: BASE64
                    .encode(format!("{}:{}", u.name, u.secret))
                    .into_bytes(),
                name: u.name,
            })
            .collect();
        Ok(Self {
            realm: config.realm,
            users,
        })
    }

    fn unauthorized(&self, ctx: &mut RequestCtx) {
        ctx.error(401, "Unauthorized");
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm={}", self.realm)) {
            ctx.response.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
    }
}

const BASIC_PREFIX: &[u8] = b"Basic ";

impl Filter for BasicAuth {
    /// Examines the Authorization header. An absent header yields 401 with
    /// a challenge, an unknown scheme yields 400, a match stores the user
    /// name on the context.
    fn request(&self, ctx: &mut RequestCtx) -> bool {
        let header = match ctx.request.headers().get(AUTHORIZATION) {
            Some(h) => h.as_bytes().to_vec(),
            None => {
                self.unauthorized(ctx);
                return false;
            }
        };
        if !header.starts_with(BASIC_PREFIX) {
            ctx.error(400, "Unknown authorization");
            return false;
        }
        let auth = &header[BASIC_PREFIX.len()..];
        for u in &self.users {
            if auth == u.auth {
                ctx.username = Some(u.name.clone());
                return true;
            }
        }
        self.unauthorized(ctx);
        false
    }
}

pub fn new_basic_auth_filter(cfg: &Value) -> FasthttpdResult<Arc<dyn Filter>> {
    Ok(Arc::new(BasicAuth::new(cfg)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_ctx;
    use std::io::Write;

    fn basic_auth(yaml: &str) -> BasicAuth {
        BasicAuth::new(&serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    fn authorize(ctx: &mut RequestCtx, user: &str, secret: &str) {
        let value = format!("Basic {}", BASE64.encode(format!("{}:{}", user, secret)));
        ctx.request
            .headers_mut()
            .insert(AUTHORIZATION, value.parse().unwrap());
    }

    #[test]
    fn test_missing_header_is_challenged() {
        let f = basic_auth("{type: basicAuth, users: [{name: u1, secret: s1}]}");
        let mut ctx = test_ctx("GET", "/private");
        assert!(!f.request(&mut ctx));
        assert_eq!(ctx.status(), 401);
        assert_eq!(
            ctx.response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=Restricted"
        );
    }

    #[test]
    fn test_custom_realm() {
        let f = basic_auth("{type: basicAuth, realm: Private, users: [{name: u1, secret: s1}]}");
        let mut ctx = test_ctx("GET", "/private");
        assert!(!f.request(&mut ctx));
        assert_eq!(
            ctx.response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=Private"
        );
    }

    #[test]
    fn test_unknown_scheme_is_bad_request() {
        let f = basic_auth("{type: basicAuth, users: [{name: u1, secret: s1}]}");
        let mut ctx = test_ctx("GET", "/private");
        ctx.request
            .headers_mut()
            .insert(AUTHORIZATION, "Bearer token".parse().unwrap());
        assert!(!f.request(&mut ctx));
        assert_eq!(ctx.status(), 400);
    }

    #[test]
    fn test_valid_credentials_store_username() {
        let f = basic_auth("{type: basicAuth, users: [{name: u1, secret: s1}]}");
        let mut ctx = test_ctx("GET", "/private");
        authorize(&mut ctx, "u1", "s1");
        assert!(f.request(&mut ctx));
        assert_eq!(ctx.username.as_deref(), Some("u1"));
        assert_eq!(ctx.status(), 200);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let f = basic_auth("{type: basicAuth, users: [{name: u1, secret: s1}]}");
        let mut ctx = test_ctx("GET", "/private");
        authorize(&mut ctx, "u1", "wrong");
        assert!(!f.request(&mut ctx));
        assert_eq!(ctx.status(), 401);
        assert!(ctx.username.is_none());
    }

    #[test]
    fn test_users_file_is_merged() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "- name: u2\n  secret: s2").unwrap();
        file.flush().unwrap();

        let yaml = format!(
            "{{type: basicAuth, users: [{{name: u1, secret: s1}}], usersFile: {}}}",
            file.path().display()
        );
        let f = basic_auth(&yaml);

        let mut ctx = test_ctx("GET", "/private");
        authorize(&mut ctx, "u2", "s2");
        assert!(f.request(&mut ctx));
        assert_eq!(ctx.username.as_deref(), Some("u2"));
    }
}
