use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub enum Route {
    // `fail_range_from` answers 500 to the ranged GET starting at that offset.
    Bytes {
        body: Vec<u8>,
        accept_ranges: bool,
        fail_range_from: Option<u64>,
    },
    Html(String),
    Json(String),
    Status(u16),
}

impl Route {
    pub fn bytes(body: Vec<u8>) -> Self {
        Route::Bytes {
            body,
            accept_ranges: true,
            fail_range_from: None,
        }
    }
}

pub struct TestServer {
    pub base_url: String,
    ranged_gets: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(routes: Vec<(&str, Route)>) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("test server address");
        let routes: Arc<HashMap<String, Route>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, route)| (path.to_string(), route))
                .collect(),
        );
        let ranged_gets = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ranged_gets);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = Arc::clone(&routes);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let _ = serve(stream, &routes, &counter).await;
                });
            }
        });
        Self {
            base_url: format!("http://127.0.0.1:{}", addr.port()),
            ranged_gets,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn ranged_gets(&self) -> usize {
        self.ranged_gets.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    stream: TcpStream,
    routes: &HashMap<String, Route>,
    ranged_gets: &AtomicUsize,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("range")
        {
            range = parse_range(value.trim());
        }
    }

    let head_only = method == "HEAD";
    let Some(route) = routes.get(&path) else {
        return write_response(&mut writer, 404, &[], b"not found", head_only).await;
    };

    match route {
        Route::Html(body) => {
            let headers = [("Content-Type", String::from("text/html; charset=utf-8"))];
            write_response(&mut writer, 200, &headers, body.as_bytes(), head_only).await
        }
        Route::Json(body) => {
            let headers = [("Content-Type", String::from("application/json"))];
            write_response(&mut writer, 200, &headers, body.as_bytes(), head_only).await
        }
        Route::Status(code) => write_response(&mut writer, *code, &[], b"", head_only).await,
        Route::Bytes {
            body,
            accept_ranges,
            fail_range_from,
        } => {
            let mut headers = vec![("Content-Type", String::from("video/mp4"))];
            if *accept_ranges {
                headers.push(("Accept-Ranges", String::from("bytes")));
            }
            let ranged = range.filter(|_| *accept_ranges && !head_only);
            let Some((start, end)) = ranged else {
                return write_response(&mut writer, 200, &headers, body, head_only).await;
            };
            ranged_gets.fetch_add(1, Ordering::SeqCst);
            if *fail_range_from == Some(start) {
                return write_response(&mut writer, 500, &[], b"", false).await;
            }
            let total = body.len() as u64;
            let end = end.min(total.saturating_sub(1));
            if start > end {
                return write_response(&mut writer, 416, &[], b"", false).await;
            }
            headers.push(("Content-Range", format!("bytes {start}-{end}/{total}")));
            let slice = &body[start as usize..=end as usize];
            write_response(&mut writer, 206, &headers, slice, false).await
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let range = value.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    headers: &[(&str, String)],
    body: &[u8],
    head_only: bool,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        _ => "Internal Server Error",
    };
    let mut head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    if !head_only {
        writer.write_all(body).await?;
    }
    writer.shutdown().await
}
