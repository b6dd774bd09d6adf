//! Online/offline tracking.

use futures::channel::mpsc::UnboundedReceiver;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::http::HttpClient;

/// A source of online (`true`) / offline (`false`) events.
///
/// Events need not be transitions; repeats are filtered by the monitor.
pub trait ConnectivitySource {
  fn into_events(self) -> BoxStream<'static, bool>;
}

impl ConnectivitySource for UnboundedReceiver<bool> {
  fn into_events(self) -> BoxStream<'static, bool> {
    self.boxed()
  }
}

impl ConnectivitySource for BoxStream<'static, bool> {
  fn into_events(self) -> BoxStream<'static, bool> {
    self
  }
}

/// Reachability flag with edge detection.
pub struct ConnectivityMonitor {
  online: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (online, _) = watch::channel(initially_online);
    Self { online }
  }

  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  /// Watch the reachability flag.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.online.subscribe()
  }

  /// Record the current reachability.
  ///
  /// Returns true only on an offline to online transition.
  pub fn update(&self, online: bool) -> bool {
    let was_online = self.online.send_replace(online);
    if was_online != online {
      info!(online, "connectivity changed");
    }
    !was_online && online
  }
}

/// Polls the API health endpoint.
///
/// A reachable health URL does not guarantee the next API call succeeds.
pub struct HttpProbe {
  client: HttpClient,
  interval: Duration,
}

impl HttpProbe {
  pub fn new(client: HttpClient, interval: Duration) -> Self {
    Self { client, interval }
  }
}

impl ConnectivitySource for HttpProbe {
  fn into_events(self) -> BoxStream<'static, bool> {
    stream::unfold((self, true), |(probe, first)| async move {
      if !first {
        tokio::time::sleep(probe.interval).await;
      }
      let online = probe.client.is_reachable().await;
      debug!(online, "probed connectivity");
      Some((online, (probe, false)))
    })
    .boxed()
  }
}
