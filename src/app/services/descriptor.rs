use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::config::{
    AppPaths, Timeouts, ALTERNATE_SOCKET_ADDRESS, ANISETTE_HOST, ANISETTE_PORT,
    ANISETTE_SERVER_ENV, ANISETTE_URL, DEVICE_ID_PROGRAM, SOCKET_ADDRESS_ENV,
};
use crate::app::device::locator::DeviceLocator;
use crate::app::process::control::ProcessControl;
use crate::app::process::runner::{CommandRunner, CommandSpec};

pub type ReadinessProbe = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type EnvResolver = Arc<dyn Fn(&str) -> Vec<(String, Option<String>)> + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Attestation data provider reachable over local HTTP.
    Anisette,
    /// Socket multiplexer that exposes network-connected devices on the alternate address.
    Multiplexer,
    /// Long-running installer helper daemon.
    Helper,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::Anisette,
        ServiceKind::Multiplexer,
        ServiceKind::Helper,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Anisette => "anisette-server",
            ServiceKind::Multiplexer => "netmuxd",
            ServiceKind::Helper => "AltServer",
        }
    }
}

#[derive(Clone)]
pub struct ServiceDescriptor {
    pub kind: ServiceKind,
    pub binary_path: PathBuf,
    pub spawn_args: Vec<String>,
    /// Evaluated at spawn time; the helper's socket choice depends on what is attached.
    pub spawn_env: EnvResolver,
    pub readiness_probe: ReadinessProbe,
}

impl ServiceDescriptor {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Command-line substring that identifies this service in the process table.
    pub fn signature(&self) -> String {
        self.binary_path.to_string_lossy().to_string()
    }

    pub fn binary_present(&self) -> bool {
        self.binary_path.is_file()
    }
}

pub fn static_env(pairs: &[(&str, Option<&str>)]) -> EnvResolver {
    let owned: Vec<(String, Option<String>)> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.map(|v| v.to_string())))
        .collect();
    Arc::new(move |_trace_id: &str| owned.clone())
}

/// Reachable and answering with something JSON-shaped within the first 2 KiB.
pub fn http_json_probe(url: &str, timeout: Duration) -> bool {
    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => {
            debug!(error = %err, "failed to build probe client");
            return false;
        }
    };
    let response = match client.get(url).send() {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            debug!(url = %url, status = %response.status(), "probe returned error status");
            return false;
        }
        Err(err) => {
            debug!(url = %url, error = %err, "probe request failed");
            return false;
        }
    };
    let mut body = Vec::new();
    if response.take(2048).read_to_end(&mut body).is_err() {
        return false;
    }
    body.contains(&b'{')
}

pub fn multiplexer_probe_spec(timeout: Duration) -> CommandSpec {
    CommandSpec::new(DEVICE_ID_PROGRAM, &["-n", "-l"], timeout)
        .with_env(SOCKET_ADDRESS_ENV, ALTERNATE_SOCKET_ADDRESS)
}

pub fn anisette_descriptor(paths: &AppPaths, timeouts: &Timeouts) -> ServiceDescriptor {
    let timeout = timeouts.anisette_probe;
    ServiceDescriptor {
        kind: ServiceKind::Anisette,
        binary_path: paths.anisette_server(),
        spawn_args: vec![
            "-n".to_string(),
            ANISETTE_HOST.to_string(),
            "-p".to_string(),
            ANISETTE_PORT.to_string(),
        ],
        spawn_env: static_env(&[]),
        readiness_probe: Arc::new(move |_trace_id: &str| http_json_probe(ANISETTE_URL, timeout)),
    }
}

pub fn multiplexer_descriptor(
    paths: &AppPaths,
    timeouts: &Timeouts,
    runner: Arc<dyn CommandRunner>,
) -> ServiceDescriptor {
    let spec = multiplexer_probe_spec(timeouts.netmuxd_probe);
    ServiceDescriptor {
        kind: ServiceKind::Multiplexer,
        binary_path: paths.netmuxd(),
        spawn_args: vec![
            "--disable-unix".to_string(),
            "--host".to_string(),
            ANISETTE_HOST.to_string(),
        ],
        spawn_env: static_env(&[]),
        readiness_probe: Arc::new(move |trace_id: &str| {
            runner
                .run(&spec, trace_id)
                .map(|output| output.success())
                .unwrap_or(false)
        }),
    }
}

/// The helper only sees directly attached devices on the default socket, so it is
/// pointed at the alternate socket only when nothing is attached locally.
pub fn helper_descriptor(
    paths: &AppPaths,
    processes: Arc<dyn ProcessControl>,
    locator: Arc<DeviceLocator>,
) -> ServiceDescriptor {
    let signature = paths.altserver().to_string_lossy().to_string();
    ServiceDescriptor {
        kind: ServiceKind::Helper,
        binary_path: paths.altserver(),
        spawn_args: Vec::new(),
        spawn_env: Arc::new(move |trace_id: &str| {
            let mut env = helper_base_env();
            if locator.local_identifiers(trace_id).is_empty() {
                env.push((
                    SOCKET_ADDRESS_ENV.to_string(),
                    Some(ALTERNATE_SOCKET_ADDRESS.to_string()),
                ));
            } else {
                env.push((SOCKET_ADDRESS_ENV.to_string(), None));
            }
            env
        }),
        readiness_probe: Arc::new(move |_trace_id: &str| processes.is_running(&signature)),
    }
}

pub fn helper_base_env() -> Vec<(String, Option<String>)> {
    vec![
        (ANISETTE_SERVER_ENV.to_string(), Some(ANISETTE_URL.to_string())),
        ("AVAHI_COMPAT_NOWARN".to_string(), Some("1".to_string())),
    ]
}

pub fn standard_descriptors(
    paths: &AppPaths,
    timeouts: &Timeouts,
    runner: Arc<dyn CommandRunner>,
    processes: Arc<dyn ProcessControl>,
    locator: Arc<DeviceLocator>,
) -> Vec<ServiceDescriptor> {
    vec![
        anisette_descriptor(paths, timeouts),
        multiplexer_descriptor(paths, timeouts, runner),
        helper_descriptor(paths, processes, locator),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 1024];
                let _ = std::io::Read::read(&mut stream, &mut request);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn http_probe_accepts_json_body() {
        let url = serve_once("{\"X-Apple-I-MD\":\"abc\"}");
        assert!(http_json_probe(&url, Duration::from_secs(2)));
    }

    #[test]
    fn http_probe_rejects_non_json_body() {
        let url = serve_once("hello");
        assert!(!http_json_probe(&url, Duration::from_secs(2)));
    }

    #[test]
    fn http_probe_fails_fast_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        assert!(!http_json_probe(&format!("http://{addr}"), Duration::from_millis(500)));
    }

    #[test]
    fn descriptors_use_paths_and_fixed_flags() {
        let paths = AppPaths::new("/data/althea");
        let anisette = anisette_descriptor(&paths, &Timeouts::default());
        assert_eq!(anisette.signature(), "/data/althea/anisette-server");
        assert_eq!(anisette.spawn_args, vec!["-n", "127.0.0.1", "-p", "6969"]);
        assert!(!anisette.binary_present());
        assert!((anisette.spawn_env)("t").is_empty());
    }

    #[test]
    fn multiplexer_probe_targets_alternate_socket() {
        let spec = multiplexer_probe_spec(Duration::from_millis(500));
        assert_eq!(spec.args, vec!["-n", "-l"]);
        assert_eq!(spec.env_value(SOCKET_ADDRESS_ENV), Some(ALTERNATE_SOCKET_ADDRESS));
    }
}
