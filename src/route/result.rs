use crate::pool::{Pool, Poolable};
use crate::util;

static RESULT_POOL: Pool<RouteResult> = Pool::new();

/// Returns an empty [`RouteResult`] from the pool.
///
/// The returned result should be handed back with [`release_result`] when
/// no longer needed so the backing buffers are recycled.
pub fn acquire_result() -> RouteResult {
    RESULT_POOL.acquire()
}

/// Returns a result acquired via [`acquire_result`] to the pool.
pub fn release_result(result: RouteResult) {
    RESULT_POOL.release(result);
}

/// The computed disposition for one request.
#[derive(Debug, Default)]
pub struct RouteResult {
    pub status_code: u16,
    pub status_message: Vec<u8>,
    pub rewrite_uri: Vec<u8>,
    pub redirect_uri: Vec<u8>,
    pub append_query_string: bool,
    pub handler: String,
    /// Filter names in declaration order, without repeats.
    pub filters: Vec<String>,
    /// Index of the producing route, relative to the scan offset.
    pub route_index: usize,
}

impl Poolable for RouteResult {
    fn reset(&mut self) {
        self.status_code = 0;
        self.status_message.clear();
        self.rewrite_uri.clear();
        self.redirect_uri.clear();
        self.append_query_string = false;
        self.handler.clear();
        self.filters.clear();
        self.route_index = 0;
    }
}

impl RouteResult {
    /// Returns the rewrite URI with the request's query string appended
    /// when `appendQueryString` is set.
    pub fn rewrite_uri_with_query_string(&self, query: &[u8]) -> Vec<u8> {
        if self.append_query_string && !self.rewrite_uri.is_empty() {
            return util::append_query_string(&self.rewrite_uri, query);
        }
        self.rewrite_uri.clone()
    }

    /// Returns the redirect URI with the request's query string appended
    /// when `appendQueryString` is set.
    pub fn redirect_uri_with_query_string(&self, query: &[u8]) -> Vec<u8> {
        if self.append_query_string && !self.redirect_uri.is_empty() {
            return util::append_query_string(&self.redirect_uri, query);
        }
        self.redirect_uri.clone()
    }

    /// Copies this result into `dst`, reusing dst's buffers.
    pub fn copy_to(&self, dst: &mut RouteResult) {
        dst.reset();
        dst.status_code = self.status_code;
        dst.status_message.extend_from_slice(&self.status_message);
        dst.rewrite_uri.extend_from_slice(&self.rewrite_uri);
        dst.redirect_uri.extend_from_slice(&self.redirect_uri);
        dst.append_query_string = self.append_query_string;
        dst.handler.push_str(&self.handler);
        dst.filters.extend(self.filters.iter().cloned());
        dst.route_index = self.route_index;
    }

    /// Reports whether two results describe the same disposition. The
    /// route index is ignored: a cached scan and a fresh scan may observe
    /// it relative to different offsets.
    pub fn equal(&self, other: &RouteResult) -> bool {
        self.status_code == other.status_code
            && self.status_message == other.status_message
            && self.rewrite_uri == other.rewrite_uri
            && self.redirect_uri == other.redirect_uri
            && self.append_query_string == other.append_query_string
            && self.handler == other.handler
            && self.filters == other.filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RouteResult {
        RouteResult {
            status_code: 302,
            status_message: b"Found".to_vec(),
            rewrite_uri: b"/view?id=1".to_vec(),
            redirect_uri: Vec::new(),
            append_query_string: true,
            handler: "backend".to_string(),
            filters: vec!["auth".to_string()],
            route_index: 3,
        }
    }

    #[test]
    fn test_copy_to_preserves_everything() {
        let src = sample();
        let mut dst = acquire_result();
        src.copy_to(&mut dst);
        assert!(src.equal(&dst));
        assert_eq!(dst.route_index, 3);
        release_result(dst);
    }

    #[test]
    fn test_equal_ignores_route_index() {
        let a = sample();
        let mut b = sample();
        b.route_index = 0;
        assert!(a.equal(&b));

        b.handler = "other".to_string();
        assert!(!a.equal(&b));
    }

    #[test]
    fn test_release_resets() {
        let mut r = acquire_result();
        sample().copy_to(&mut r);
        release_result(r);

        let r = acquire_result();
        assert_eq!(r.status_code, 0);
        assert!(r.status_message.is_empty());
        assert!(r.handler.is_empty());
        assert!(r.filters.is_empty());
        release_result(r);
    }

    #[test]
    fn test_query_string_projection() {
        let r = sample();
        assert_eq!(
            r.rewrite_uri_with_query_string(b"page=2"),
            b"/view?id=1&page=2"
        );

        let mut plain = sample();
        plain.append_query_string = false;
        assert_eq!(plain.rewrite_uri_with_query_string(b"page=2"), b"/view?id=1");

        let mut redirect = sample();
        redirect.redirect_uri = b"http://example.com/".to_vec();
        assert_eq!(
            redirect.redirect_uri_with_query_string(b"x=1"),
            b"http://example.com/?x=1"
        );
    }
}
