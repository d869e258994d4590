use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if let Ok(_) = TcpStream::connect(("127.0.0.1", port)) {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

pub struct Server {
    child: ScopedChild,
    port: u16,
    second_port: u16,
    root: TempDir,
}

impl Server {
    /// Spawn the server binary on an unused port with a config built from
    /// `template`, where `{root}`, `{port}` and `{port2}` are substituted.
    pub fn with_config(template: &str) -> Self {
        let root = tempdir().expect("failed to create tempdir");

        // Assumes the ports won't be reused before the server starts.
        let port = get_unused_port().expect("failed to get unused port");
        let second_port = get_unused_port().expect("failed to get unused port");

        let config_text = template
            .replace("{root}", root.path().to_str().expect("path is not valid UTF-8"))
            .replace("{port2}", &format!("{}", second_port))
            .replace("{port}", &format!("{}", port));
        let config_path = root.path().join("server.conf");
        std::fs::write(&config_path, config_text).expect("failed to write config");

        let child = Command::new(env!("CARGO_BIN_EXE_palehttpd"))
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn palehttpd")
            .into();

        let server = Self {
            child,
            port,
            second_port,
            root,
        };

        // Wait until the socket is open.
        assert!(wait_for_port(server.port), "failed to connect to palehttpd");

        server
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) -> PathBuf {
        let path = self.root().join(name);
        create_dir_all(&path).expect("failed to create directory");
        path
    }

    pub fn create_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.root().join(name);
        let mut file = File::create(&path).expect("failed to create file");
        file.write_all(contents).expect("failed to write file");
        path
    }

    pub fn create_script(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.create_file(name, contents.as_bytes());
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("failed to chmod script");
        path
    }

    pub fn stream(&self) -> TcpStream {
        self.stream_on(self.port)
    }

    pub fn second_stream(&self) -> TcpStream {
        self.stream_on(self.second_port)
    }

    fn stream_on(&self, port: u16) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", port)).expect("failed to connect to palehttpd");
        // Set timeouts to prevent tests from hanging.
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw request bytes and read one framed response.
    pub fn request(&self, raw: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(raw).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    /// Send raw request bytes and read until the server closes.
    pub fn request_to_eof(&self, raw: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(raw).unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).expect("failed to read response");
        buf
    }

    pub fn signal_and_wait(mut self, signal: nix::sys::signal::Signal) -> i32 {
        let pid = nix::unistd::Pid::from_raw(self.child.0.id() as i32);
        nix::sys::signal::kill(pid, signal).expect("failed to signal server");
        for _ in 0..500 {
            if let Some(exit_status) = self.child.0.try_wait().expect("wait failed") {
                return exit_status.code().unwrap_or(-1);
            }
            sleep(Duration::from_millis(10));
        }
        panic!("server did not exit after signal");
    }
}

/// One HTTP response, framed by Content-Length.
pub struct Response {
    pub response_line: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header_line(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header_line(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header_line<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn status(&self) -> u16 {
        self.response_line
            .split(' ')
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("response line has no status code")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8(self.body.clone().unwrap_or_default()).expect("body is not valid UTF-8")
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
