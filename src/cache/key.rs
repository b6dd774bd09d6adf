//! Request key derivation.

use url::form_urlencoded;

/// Build the cache key for a request.
///
/// Params are sorted by name (then value) so callers that pass the same
/// params in a different order share one entry.
pub fn cache_key(endpoint: &str, params: &[(&str, &str)]) -> String {
  if params.is_empty() {
    return endpoint.to_string();
  }

  let mut sorted = params.to_vec();
  sorted.sort();

  let query = form_urlencoded::Serializer::new(String::new())
    .extend_pairs(sorted)
    .finish();

  format!("{}?{}", endpoint, query)
}

/// Whether `key` was derived from `endpoint`, with or without params.
pub fn key_matches_endpoint(key: &str, endpoint: &str) -> bool {
  match key.strip_prefix(endpoint) {
    Some(rest) => rest.is_empty() || rest.starts_with('?'),
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_no_params_is_endpoint() {
    assert_eq!(cache_key("/products", &[]), "/products");
  }

  #[test]
  fn test_param_order_does_not_matter() {
    let a = cache_key("/products", &[("page", "2"), ("category", "tea")]);
    let b = cache_key("/products", &[("category", "tea"), ("page", "2")]);
    assert_eq!(a, b);
    assert_eq!(a, "/products?category=tea&page=2");
  }

  #[test]
  fn test_values_are_encoded() {
    let key = cache_key("/search", &[("q", "green tea&milk")]);
    assert_eq!(key, "/search?q=green+tea%26milk");
  }

  #[test]
  fn test_endpoint_matching() {
    assert!(key_matches_endpoint("/products", "/products"));
    assert!(key_matches_endpoint("/products?page=1", "/products"));
    assert!(!key_matches_endpoint("/products/7", "/products"));
    assert!(!key_matches_endpoint("/orders", "/products"));
  }
}
