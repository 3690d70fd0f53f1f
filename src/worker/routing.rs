//! Ordered routing rules: the first matching `(predicate, strategy)` pair wins.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Deserialize;

use crate::net::{Destination, Request};

/// How a matched request is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
  /// Not intercepted, the request goes to the network untouched
  Passthrough,
  /// Network, falling back to the cached entry under `fallback`
  /// (or the request's own URL when `None`)
  NetworkFirst { fallback: Option<String> },
  /// Cached entry now, refreshed in the background
  StaleWhileRevalidate,
  /// Cached entry if present, otherwise network and store
  CacheFirst,
}

/// Strategy names as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
  Passthrough,
  NetworkFirst,
  StaleWhileRevalidate,
  CacheFirst,
}

/// Request selector.
///
/// `path_prefix`, `extension` and `destination` are alternatives: when any of
/// them is set, at least one entry across them must match. An empty selector
/// matches every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteMatch {
  /// Require (or exclude) navigation requests
  pub navigate: Option<bool>,
  pub path_prefix: Vec<String>,
  /// File extensions, with or without the leading dot
  pub extension: Vec<String>,
  pub destination: Vec<Destination>,
  /// Paths never matched by this rule
  pub except_prefix: Vec<String>,
}

impl RouteMatch {
  pub fn matches(&self, request: &Request) -> bool {
    if let Some(navigate) = self.navigate {
      if request.is_navigation() != navigate {
        return false;
      }
    }

    let path = request.url.path();
    if self
      .except_prefix
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
    {
      return false;
    }

    if self.path_prefix.is_empty() && self.extension.is_empty() && self.destination.is_empty() {
      return true;
    }

    self
      .path_prefix
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
      || self.extension.iter().any(|ext| has_extension(path, ext))
      || self.destination.contains(&request.destination)
  }
}

fn has_extension(path: &str, ext: &str) -> bool {
  let ext = ext.trim_start_matches('.');
  path
    .rsplit('/')
    .next()
    .and_then(|segment| segment.rsplit_once('.'))
    .is_some_and(|(_, actual)| actual.eq_ignore_ascii_case(ext))
}

/// Rule predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
  /// Any method other than GET
  NonGet,
  Match(RouteMatch),
}

impl Predicate {
  pub fn matches(&self, request: &Request) -> bool {
    match self {
      Self::NonGet => request.method != Method::GET,
      Self::Match(selector) => selector.matches(request),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub predicate: Predicate,
  pub strategy: Strategy,
}

/// A routing rule as written in config files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
  #[serde(default)]
  pub when: RouteMatch,
  pub strategy: StrategyKind,
  /// Fallback cache key (path) for `network-first`
  #[serde(default)]
  pub fallback: Option<String>,
}

impl RouteConfig {
  fn into_route(self) -> Result<Route> {
    let strategy = match (self.strategy, self.fallback) {
      (StrategyKind::NetworkFirst, fallback) => Strategy::NetworkFirst { fallback },
      (kind, Some(fallback)) => {
        return Err(eyre!(
          "Route fallback '{}' is only supported with network-first, not {:?}",
          fallback,
          kind
        ))
      }
      (StrategyKind::Passthrough, None) => Strategy::Passthrough,
      (StrategyKind::StaleWhileRevalidate, None) => Strategy::StaleWhileRevalidate,
      (StrategyKind::CacheFirst, None) => Strategy::CacheFirst,
    };

    Ok(Route {
      predicate: Predicate::Match(self.when),
      strategy,
    })
  }
}

static PASSTHROUGH: Strategy = Strategy::Passthrough;

/// Ordered rule table. Non-GET passthrough is always the first rule.
#[derive(Debug, Clone)]
pub struct Router {
  routes: Vec<Route>,
}

impl Router {
  pub fn new(routes: Vec<Route>) -> Self {
    let mut all = Vec::with_capacity(routes.len() + 1);
    all.push(Route {
      predicate: Predicate::NonGet,
      strategy: Strategy::Passthrough,
    });
    all.extend(routes);
    Self { routes: all }
  }

  /// Build from configured rules, or the default table when none are given.
  pub fn from_config(routes: Option<&[RouteConfig]>, navigation_fallback: &str) -> Result<Self> {
    match routes {
      Some(routes) => {
        let routes = routes
          .iter()
          .cloned()
          .map(RouteConfig::into_route)
          .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(routes))
      }
      None => Ok(Self::new(default_routes(navigation_fallback))),
    }
  }

  /// Strategy of the first matching rule; unmatched requests pass through.
  pub fn route(&self, request: &Request) -> &Strategy {
    self
      .routes
      .iter()
      .find(|route| route.predicate.matches(request))
      .map(|route| &route.strategy)
      .unwrap_or(&PASSTHROUGH)
  }
}

/// Navigations network-first, icons and images stale-while-revalidate,
/// everything else cache-first.
pub fn default_routes(navigation_fallback: &str) -> Vec<Route> {
  vec![
    Route {
      predicate: Predicate::Match(RouteMatch {
        navigate: Some(true),
        ..Default::default()
      }),
      strategy: Strategy::NetworkFirst {
        fallback: Some(navigation_fallback.to_string()),
      },
    },
    Route {
      predicate: Predicate::Match(RouteMatch {
        path_prefix: vec!["/icons".to_string()],
        destination: vec![Destination::Image],
        ..Default::default()
      }),
      strategy: Strategy::StaleWhileRevalidate,
    },
    Route {
      predicate: Predicate::Match(RouteMatch::default()),
      strategy: Strategy::CacheFirst,
    },
  ]
}
