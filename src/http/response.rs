//! HTTP response composition.
//!
//! Resolves a request path under the document root, fixes the status code
//! from the file's state, and writes status line plus headers into the
//! connection's write buffer. The body is either a read-only memory mapping
//! of the resolved file (owned by the response, unmapped on drop) or a small
//! generated error page appended inline when no file can back the response.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::runtime::Buffer;

/// Read-only memory mapping of a response file, unmapped on drop.
#[derive(Debug)]
pub struct FileMapping {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is private, read-only and never remapped, so views of it may
// move between the composing worker and whichever worker flushes it.
unsafe impl Send for FileMapping {}
unsafe impl Sync for FileMapping {}

impl FileMapping {
    /// Map `path` read-only. Empty files become an empty slice without
    /// touching mmap (the kernel rejects zero-length mappings).
    pub fn map(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(Self {
                ptr: std::ptr::null_mut(),
                len: 0,
            });
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
        }
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { libc::munmap(self.ptr, self.len) };
        }
    }
}

/// One composed response: status, connection mode, and the backing file.
#[derive(Debug)]
pub struct Response {
    code: u16,
    keep_alive: bool,
    path: PathBuf,
    mapping: Option<FileMapping>,
}

impl Response {
    /// Resolve `url_path` under `root` and settle the status code. A preset
    /// `status` (a 400 from the parser) skips file resolution; otherwise the
    /// file's state decides between 200, 403 and 404. Non-200 responses are
    /// redirected to the matching static error page when one exists.
    pub fn new(root: &Path, url_path: &str, keep_alive: bool, status: Option<u16>) -> Self {
        let mut path = root.join(url_path.trim_start_matches('/'));
        let mut code = match status {
            Some(code) => code,
            None if !is_confined(url_path) => 403,
            None => resolve_status(&path),
        };
        if !matches!(code, 200 | 400 | 403 | 404) {
            code = 400;
        }
        if code != 200 {
            let error_page = root.join(format!("{}.html", code));
            if fs::metadata(&error_page).map(|m| m.is_file()).unwrap_or(false) {
                path = error_page;
            }
        }
        Self {
            code,
            keep_alive,
            path,
            mapping: None,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Write status line and headers into `buf` and map the body file.
    /// When no file backs the response, a generated error page goes into
    /// `buf` inline instead.
    pub fn compose(&mut self, buf: &mut Buffer) {
        buf.append(format!("HTTP/1.1 {} {}\r\n", self.code, reason_phrase(self.code)).as_bytes());
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }
        match FileMapping::map(&self.path) {
            Ok(mapping) => {
                buf.append(format!("Content-type: {}\r\n", mime_for(&self.path)).as_bytes());
                buf.append(format!("Content-length: {}\r\n\r\n", mapping.len()).as_bytes());
                self.mapping = Some(mapping);
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No file backs response, serving generated error body");
                self.append_error_body(buf);
            }
        }
    }

    /// Mapped body bytes; empty when the body went inline.
    pub fn payload(&self) -> &[u8] {
        self.mapping.as_ref().map(FileMapping::as_slice).unwrap_or(&[])
    }

    fn append_error_body(&self, buf: &mut Buffer) {
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n\
             <p>File NotFound!</p><hr><em>serve-a-page</em></body></html>",
            self.code,
            reason_phrase(self.code)
        );
        buf.append(b"Content-type: text/html\r\n");
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Bad Request",
    }
}

/// Missing files and directories are 404, files without the world-read bit
/// are 403, everything else serves.
fn resolve_status(path: &Path) -> u16 {
    match fs::metadata(path) {
        Err(_) => 404,
        Ok(meta) if meta.is_dir() => 404,
        Ok(meta) if meta.permissions().mode() & 0o004 == 0 => 403,
        Ok(_) => 200,
    }
}

/// Reject any path with a parent-directory segment before it reaches the
/// filesystem.
fn is_confined(url_path: &str) -> bool {
    !url_path.split('/').any(|segment| segment == "..")
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "html" => "text/html",
        "xml" => "text/xml",
        "xhtml" => "application/xhtml+xml",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        "pdf" => "application/pdf",
        "word" => "application/nsword",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "au" => "audio/basic",
        "mpeg" | "mpg" => "video/mpeg",
        "avi" => "video/x-msvideo",
        "gz" => "application/x-gzip",
        "tar" => "application/x-tar",
        "css" => "text/css",
        "js" => "text/javascript",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("serve-a-page-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn compose_to_string(resp: &mut Response) -> String {
        let mut buf = Buffer::new();
        resp.compose(&mut buf);
        String::from_utf8_lossy(buf.peek()).into_owned()
    }

    #[test]
    fn test_200_with_mapped_file() {
        let root = temp_root("ok");
        fs::write(root.join("index.html"), "<html>hi</html>").unwrap();

        let mut resp = Response::new(&root, "/index.html", true, None);
        assert_eq!(resp.code(), 200);

        let head = compose_to_string(&mut resp);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.contains("Content-length: 15\r\n\r\n"));
        assert_eq!(resp.payload(), b"<html>hi</html>");

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_404_generates_body_without_error_page() {
        let root = temp_root("missing");

        let mut resp = Response::new(&root, "/nope.html", false, None);
        assert_eq!(resp.code(), 404);

        let head = compose_to_string(&mut resp);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("404 : Not Found"));
        assert!(resp.payload().is_empty());

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_404_prefers_static_error_page() {
        let root = temp_root("page404");
        fs::write(root.join("404.html"), "<html>gone</html>").unwrap();

        let mut resp = Response::new(&root, "/nope.html", false, None);
        assert_eq!(resp.code(), 404);

        compose_to_string(&mut resp);
        assert_eq!(resp.payload(), b"<html>gone</html>");

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_403_when_world_read_missing() {
        let root = temp_root("perm");
        let secret = root.join("secret.html");
        fs::write(&secret, "top").unwrap();
        let mut perms = fs::metadata(&secret).unwrap().permissions();
        perms.set_mode(0o640);
        fs::set_permissions(&secret, perms).unwrap();

        let resp = Response::new(&root, "/secret.html", false, None);
        assert_eq!(resp.code(), 403);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_403_on_parent_traversal() {
        let root = temp_root("traverse");

        let resp = Response::new(&root, "/../../etc/passwd", false, None);
        assert_eq!(resp.code(), 403);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_preset_400_skips_resolution() {
        let root = temp_root("preset");

        let mut resp = Response::new(&root, "", false, Some(400));
        assert_eq!(resp.code(), 400);
        let head = compose_to_string(&mut resp);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_directory_is_404() {
        let root = temp_root("dir");
        fs::create_dir_all(root.join("sub")).unwrap();

        let resp = Response::new(&root, "/sub", false, None);
        assert_eq!(resp.code(), 404);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_mime_table() {
        assert_eq!(mime_for(Path::new("a.css")), "text/css");
        assert_eq!(mime_for(Path::new("a.js")), "text/javascript");
        assert_eq!(mime_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a.unknown")), "text/plain");
        assert_eq!(mime_for(Path::new("noext")), "text/plain");
    }

    #[test]
    fn test_empty_file_maps_empty() {
        let root = temp_root("empty");
        fs::write(root.join("empty.html"), "").unwrap();

        let mut resp = Response::new(&root, "/empty.html", false, None);
        assert_eq!(resp.code(), 200);
        let head = compose_to_string(&mut resp);
        assert!(head.contains("Content-length: 0\r\n\r\n"));
        assert!(resp.payload().is_empty());

        fs::remove_dir_all(&root).ok();
    }
}
