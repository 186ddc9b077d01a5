//! A tonic channel over the daemon's Unix domain socket.
//!
//! `tonic::transport::Endpoint` talks HTTP/2 over whatever connector it is
//! given; the URI itself is never dialed (a `UnixStream::connect` to the
//! socket path is), so the scheme/host below are placeholders tonic
//! requires syntactically and nothing more.

use std::path::{Path, PathBuf};

use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use choo_daemon::proto::choo_daemon_client::ChooDaemonClient;

pub async fn connect(socket_path: &Path) -> anyhow::Result<ChooDaemonClient<Channel>> {
    let path = socket_path.to_path_buf();
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "failed to connect to choo-daemon at {}: {e} (is the daemon running?)",
                socket_path.display()
            )
        })?;
    Ok(ChooDaemonClient::new(channel))
}

/// Only used to document the socket path in `--help` / error messages; not
/// a default callers should rely on silently.
pub fn describe(socket_path: &PathBuf) -> String {
    format!("unix://{}", socket_path.display())
}
