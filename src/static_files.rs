//! Static file responder for listeners configured with a static root

use crate::config::StaticRoot;
use crate::error::{json_error_response, ProxyErrorCode};
use futures::StreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::{Method, Request, Response, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

/// Serves files below one root directory
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    index: String,
    listing: bool,
}

impl StaticFiles {
    pub fn new(root: &StaticRoot) -> Self {
        Self {
            root: root.path.clone(),
            index: root.index.clone(),
            listing: root.listing,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a request path onto the filesystem.
    ///
    /// Returns `None` for paths that are not valid UTF-8 after decoding or
    /// that would escape the root.
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(request_path).ok()?;
        let mut path = self.root.clone();

        for segment in decoded.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return None,
                s if s.contains('\\') || s.contains('\0') => return None,
                s => path.push(s),
            }
        }

        Some(path)
    }

    pub async fn serve<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let head = req.method() == Method::HEAD;
        if req.method() != Method::GET && !head {
            return json_error_response(ProxyErrorCode::MethodNotAllowed, "Only GET and HEAD are supported");
        }

        let request_path = req.uri().path();
        let path = match self.resolve(request_path) {
            Some(path) => path,
            None => {
                debug!(path = request_path, "Rejected static path");
                return json_error_response(ProxyErrorCode::NotFound, "Not found");
            }
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => return io_error_response(&path, e),
        };

        if metadata.is_dir() {
            if !request_path.ends_with('/') {
                let location = match req.uri().query() {
                    Some(query) => format!("{}/?{}", request_path, query),
                    None => format!("{}/", request_path),
                };
                return redirect(&location);
            }

            let index_path = path.join(&self.index);
            let has_index = tokio::fs::metadata(&index_path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);

            if has_index {
                return self.serve_file(&index_path, head).await;
            }

            if !self.listing {
                return json_error_response(ProxyErrorCode::NotFound, "Not found");
            }

            return match render_listing(&path, request_path).await {
                Ok(html) => ok_response("text/html; charset=utf-8", Bytes::from(html), head),
                Err(e) => io_error_response(&path, e),
            };
        }

        self.serve_file(&path, head).await
    }

    async fn serve_file(&self, path: &Path, head: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => return io_error_response(path, e),
        };
        let len = match file.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(e) => return io_error_response(path, e),
        };

        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let body = if head { empty_body() } else { file_body(file, path.to_path_buf()) };
        respond(mime.as_ref(), len, body)
    }
}

/// Stream a file in chunks. A read error ends the body early, which the
/// connection reports as a truncated response.
fn file_body(file: tokio::fs::File, path: PathBuf) -> BoxBody<Bytes, hyper::Error> {
    let frames = ReaderStream::new(file).filter_map(move |chunk| {
        let frame = match chunk {
            Ok(bytes) => Some(Ok::<_, hyper::Error>(Frame::data(bytes))),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed while streaming static file");
                None
            }
        };
        futures::future::ready(frame)
    });
    BodyExt::boxed(StreamBody::new(frames))
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn ok_response(content_type: &str, body: Bytes, head: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
    let len = body.len() as u64;
    let body = if head {
        empty_body()
    } else {
        Full::new(body).map_err(|never| match never {}).boxed()
    };
    respond(content_type, len, body)
}

fn respond(content_type: &str, len: u64, body: BoxBody<Bytes, hyper::Error>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header(hyper::header::CONTENT_LENGTH, len)
        .body(body)
        .expect("valid response builder")
}

fn redirect(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .body(empty_body())
        .unwrap_or_else(|_| json_error_response(ProxyErrorCode::InternalError, "Invalid redirect"))
}

fn io_error_response(path: &Path, e: io::Error) -> Response<BoxBody<Bytes, hyper::Error>> {
    match e.kind() {
        io::ErrorKind::NotFound => json_error_response(ProxyErrorCode::NotFound, "Not found"),
        io::ErrorKind::PermissionDenied => {
            debug!(path = %path.display(), "Permission denied");
            json_error_response(ProxyErrorCode::NotFound, "Not found")
        }
        _ => {
            error!(path = %path.display(), error = %e, "Failed to read static file");
            json_error_response(ProxyErrorCode::InternalError, "Failed to read file")
        }
    }
}

async fn render_listing(dir: &Path, request_path: &str) -> io::Result<String> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let title = escape_html(request_path);
    let mut html = format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Index of {title}</title></head>\n<body><h1>Index of {title}</h1>\n<pre>\n"
    );
    for name in names {
        html.push_str(&format!(
            "<a href=\"{}\">{}</a>\n",
            urlencoding::encode(&name).replace("%2F", "/"),
            escape_html(&name)
        ));
    }
    html.push_str("</pre>\n</body></html>\n");

    Ok(html)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
