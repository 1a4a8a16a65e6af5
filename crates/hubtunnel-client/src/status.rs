//! Status reporting to an external sink
//!
//! Reports are fire-and-forget: they go through a bounded queue to a
//! background task that calls the sink, so a slow sink never holds up the
//! tunnel. When the queue is full the report is dropped.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection state of the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Reconnecting => "Reconnecting",
        };
        f.write_str(name)
    }
}

/// Outcome of one call to the local upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpConnectionStatus {
    /// 2xx response
    Succeed,
    /// Response received with a non-2xx status
    ErrorResponse,
    /// The call did not finish within the request timeout
    RequestTimeout,
    /// Connect or transport failure
    RequestFailed,
}

/// Receiver of tunnel status notifications
pub trait StatusSink: Send + Sync {
    fn report_status_change(&self, state: ConnectionState);

    fn report_service_endpoint(&self, endpoint: &str);

    fn report_tunnel_to_local_server_status(&self, status: HttpConnectionStatus);

    fn report_live_trace_url(&self, url: &str);

    fn report_local_server_url(&self, url: &str);
}

/// Status sink that writes every report to the log
#[derive(Debug, Default, Clone)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn report_status_change(&self, state: ConnectionState) {
        info!("Tunnel status: {}", state);
    }

    fn report_service_endpoint(&self, endpoint: &str) {
        info!("Service endpoint: {}", endpoint);
    }

    fn report_tunnel_to_local_server_status(&self, status: HttpConnectionStatus) {
        match status {
            HttpConnectionStatus::Succeed => debug!("Local server status: {:?}", status),
            _ => warn!("Local server status: {:?}", status),
        }
    }

    fn report_live_trace_url(&self, url: &str) {
        info!("Live trace: {}", url);
    }

    fn report_local_server_url(&self, url: &str) {
        info!("Local server: {}", url);
    }
}

#[derive(Debug)]
enum StatusReport {
    StatusChange(ConnectionState),
    ServiceEndpoint(String),
    TunnelToLocalServer(HttpConnectionStatus),
    LiveTraceUrl(String),
    LocalServerUrl(String),
}

/// Queue depth between reporters and the sink
const REPORT_QUEUE_SIZE: usize = 256;

/// Cloneable handle that forwards reports to a [`StatusSink`].
///
/// Must be created inside a tokio runtime. The consumer task ends once every
/// handle is dropped.
#[derive(Clone)]
pub struct StatusReporter {
    tx: mpsc::Sender<StatusReport>,
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        let (tx, mut rx) = mpsc::channel(REPORT_QUEUE_SIZE);

        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                match report {
                    StatusReport::StatusChange(state) => sink.report_status_change(state),
                    StatusReport::ServiceEndpoint(endpoint) => {
                        sink.report_service_endpoint(&endpoint)
                    }
                    StatusReport::TunnelToLocalServer(status) => {
                        sink.report_tunnel_to_local_server_status(status)
                    }
                    StatusReport::LiveTraceUrl(url) => sink.report_live_trace_url(&url),
                    StatusReport::LocalServerUrl(url) => sink.report_local_server_url(&url),
                }
            }
            debug!("Status reporter stopped");
        });

        Self { tx }
    }

    pub fn status_change(&self, state: ConnectionState) {
        self.push(StatusReport::StatusChange(state));
    }

    pub fn service_endpoint(&self, endpoint: &str) {
        self.push(StatusReport::ServiceEndpoint(endpoint.to_string()));
    }

    pub fn tunnel_to_local_server_status(&self, status: HttpConnectionStatus) {
        self.push(StatusReport::TunnelToLocalServer(status));
    }

    pub fn live_trace_url(&self, url: &str) {
        self.push(StatusReport::LiveTraceUrl(url.to_string()));
    }

    pub fn local_server_url(&self, url: &str) {
        self.push(StatusReport::LocalServerUrl(url.to_string()));
    }

    fn push(&self, report: StatusReport) {
        if let Err(e) = self.tx.try_send(report) {
            debug!("Dropping status report: {}", e);
        }
    }
}

impl fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<ConnectionState>>,
        urls: Mutex<Vec<String>>,
    }

    impl StatusSink for Recorder {
        fn report_status_change(&self, state: ConnectionState) {
            self.states.lock().unwrap().push(state);
        }
        fn report_service_endpoint(&self, endpoint: &str) {
            self.urls.lock().unwrap().push(endpoint.to_string());
        }
        fn report_tunnel_to_local_server_status(&self, _status: HttpConnectionStatus) {}
        fn report_live_trace_url(&self, url: &str) {
            self.urls.lock().unwrap().push(url.to_string());
        }
        fn report_local_server_url(&self, url: &str) {
            self.urls.lock().unwrap().push(url.to_string());
        }
    }

    #[tokio::test]
    async fn test_reports_reach_sink_in_order() {
        let recorder = Arc::new(Recorder::default());
        let reporter = StatusReporter::new(recorder.clone());

        reporter.status_change(ConnectionState::Connecting);
        reporter.service_endpoint("https://svc.example.com/");
        reporter.status_change(ConnectionState::Connected);
        reporter.local_server_url("http://localhost:3000/");

        for _ in 0..100 {
            let states = recorder.states.lock().unwrap().len();
            let urls = recorder.urls.lock().unwrap().len();
            if states == 2 && urls == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(
            *recorder.urls.lock().unwrap(),
            vec![
                "https://svc.example.com/".to_string(),
                "http://localhost:3000/".to_string()
            ]
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
    }
}
