//! Declarative configuration: virtual servers and per-path location blocks.
//!
//! The file format is a sequence of `server { ... }` blocks made of
//! `;`-terminated directives, with `#` comments and free-form whitespace.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};

use crate::request::Method;

pub const DEFAULT_CONFIG_PATH: &str = "default.conf";

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub root: PathBuf,
    /// 0 disables the limit.
    pub client_max_body_size: usize,
    pub index: Option<String>,
    pub autoindex: bool,
    pub error_pages: HashMap<u16, String>,
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug)]
pub struct LocationConfig {
    pub path: String,
    pub root: Option<PathBuf>,
    pub index: Option<String>,
    pub autoindex: Option<bool>,
    pub methods: Vec<Method>,
    pub redirect: Option<(u16, String)>,
    pub upload_dir: Option<String>,
    pub upload_enabled: bool,
    pub cgi_root: Option<PathBuf>,
    /// Extension (with leading dot) to interpreter path.
    pub cgi_interpreters: HashMap<String, String>,
}

impl LocationConfig {
    fn new(path: String) -> Self {
        Self {
            path,
            root: None,
            index: None,
            autoindex: None,
            methods: vec![Method::Get],
            redirect: None,
            upload_dir: None,
            upload_enabled: false,
            cgi_root: None,
            cgi_interpreters: HashMap::new(),
        }
    }

    pub fn allows(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }
}

impl ServerConfig {
    fn new() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            root: PathBuf::new(),
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            index: None,
            autoindex: false,
            error_pages: HashMap::new(),
            locations: Vec::new(),
        }
    }

    /// Exact match wins; otherwise the longest location prefix of `path`.
    pub fn match_location(&self, path: &str) -> &LocationConfig {
        if let Some(exact) = self.locations.iter().find(|loc| loc.path == path) {
            return exact;
        }
        self.locations
            .iter()
            .filter(|loc| path.starts_with(loc.path.trim_end_matches('/')))
            .max_by_key(|loc| loc.path.len())
            .unwrap_or(&self.locations[0])
    }
}

pub fn load(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to open config file {}", path))?;
    parse(&text).with_context(|| format!("in config file {}", path))
}

pub fn parse(text: &str) -> Result<Config> {
    let tokens = tokenize(text);
    let mut cursor = Cursor::new(&tokens);
    let mut servers = Vec::new();

    while !cursor.done() {
        match cursor.next()? {
            "server" => servers.push(parse_server(&mut cursor)?),
            other => bail!("unknown top-level directive `{}'", other),
        }
    }
    if servers.is_empty() {
        bail!("configuration contains no server block");
    }
    Ok(Config { servers })
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("");
        for word in line.split_whitespace() {
            let mut current = String::new();
            for c in word.chars() {
                if matches!(c, '{' | '}' | ';') {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                    tokens.push(c.to_string());
                } else {
                    current.push(c);
                }
            }
            if !current.is_empty() {
                tokens.push(current);
            }
        }
    }
    tokens
}

struct Cursor<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [String]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn next(&mut self) -> Result<&'a str> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| anyhow!("unexpected end of configuration"))?;
        self.pos += 1;
        Ok(token)
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).map(|token| token.as_str())
    }

    fn expect(&mut self, expected: &str) -> Result<()> {
        let token = self.next()?;
        if token != expected {
            bail!("expected `{}', got `{}'", expected, token);
        }
        Ok(())
    }
}

fn parse_server(cursor: &mut Cursor) -> Result<ServerConfig> {
    cursor.expect("{")?;

    let mut server = ServerConfig::new();
    let mut has_listen = false;
    let mut has_root = false;
    let mut has_index = false;
    let mut has_body_size = false;
    let mut has_autoindex = false;

    loop {
        let token = cursor.next()?;
        match token {
            "}" => break,
            "listen" => {
                if has_listen {
                    bail!("duplicate listen directive");
                }
                let (host, port) = parse_listen(cursor.next()?)?;
                server.host = host;
                server.port = port;
                has_listen = true;
                cursor.expect(";")?;
            }
            "root" => {
                if has_root {
                    bail!("duplicate root directive");
                }
                server.root = PathBuf::from(cursor.next()?);
                has_root = true;
                cursor.expect(";")?;
            }
            "index" => {
                if has_index {
                    bail!("duplicate index directive");
                }
                server.index = Some(cursor.next()?.to_string());
                has_index = true;
                cursor.expect(";")?;
            }
            "client_max_body_size" => {
                if has_body_size {
                    bail!("duplicate client_max_body_size directive");
                }
                server.client_max_body_size = parse_body_size(cursor.next()?)?;
                has_body_size = true;
                cursor.expect(";")?;
            }
            "autoindex" => {
                if has_autoindex {
                    bail!("duplicate autoindex directive");
                }
                server.autoindex = parse_on_off(cursor.next()?, "autoindex")?;
                has_autoindex = true;
                cursor.expect(";")?;
            }
            "error_page" => {
                let code: u16 = cursor
                    .next()?
                    .parse()
                    .context("invalid status code for error_page")?;
                let page = cursor.next()?.to_string();
                server.error_pages.insert(code, page);
                cursor.expect(";")?;
            }
            "location" => {
                server.locations.push(parse_location(cursor)?);
            }
            other => bail!("unknown directive in server block: `{}'", other),
        }
    }

    if !has_root {
        bail!("missing root directive in server block");
    }
    if server.locations.is_empty() {
        bail!("missing location directive in server block");
    }
    Ok(server)
}

fn parse_location(cursor: &mut Cursor) -> Result<LocationConfig> {
    let path = cursor.next()?.to_string();
    cursor.expect("{")?;

    let mut location = LocationConfig::new(path);
    let mut has_root = false;
    let mut has_index = false;
    let mut has_autoindex = false;
    let mut has_methods = false;
    let mut has_return = false;
    let mut has_upload_path = false;
    let mut has_upload_enabled = false;
    let mut has_cgi_path = false;

    loop {
        let token = cursor.next()?;
        match token {
            "}" => break,
            "root" => {
                if has_root {
                    bail!("duplicate root directive in location {}", location.path);
                }
                location.root = Some(PathBuf::from(cursor.next()?));
                has_root = true;
                cursor.expect(";")?;
            }
            "index" => {
                if has_index {
                    bail!("duplicate index directive in location {}", location.path);
                }
                location.index = Some(cursor.next()?.to_string());
                has_index = true;
                cursor.expect(";")?;
            }
            "autoindex" => {
                if has_autoindex {
                    bail!("duplicate autoindex directive in location {}", location.path);
                }
                location.autoindex = Some(parse_on_off(cursor.next()?, "autoindex")?);
                has_autoindex = true;
                cursor.expect(";")?;
            }
            "methods" => {
                if has_methods {
                    bail!("duplicate methods directive in location {}", location.path);
                }
                let mut methods = Vec::new();
                while cursor.peek() != Some(";") {
                    methods.push(parse_method(cursor.next()?)?);
                }
                if methods.is_empty() {
                    bail!("empty methods list in location {}", location.path);
                }
                location.methods = methods;
                has_methods = true;
                cursor.expect(";")?;
            }
            "return" => {
                if has_return {
                    bail!("duplicate return directive in location {}", location.path);
                }
                let code: u16 = cursor
                    .next()?
                    .parse()
                    .context("invalid status code for return")?;
                let target = cursor.next()?.to_string();
                location.redirect = Some((code, target));
                has_return = true;
                cursor.expect(";")?;
            }
            "upload_path" => {
                if has_upload_path {
                    bail!("duplicate upload_path directive in location {}", location.path);
                }
                location.upload_dir = Some(cursor.next()?.to_string());
                has_upload_path = true;
                cursor.expect(";")?;
            }
            // The original config dialect used both spellings; accept both.
            "upload_enable" | "upload_enabled" => {
                if has_upload_enabled {
                    bail!("duplicate {} directive in location {}", token, location.path);
                }
                location.upload_enabled = parse_on_off(cursor.next()?, token)?;
                has_upload_enabled = true;
                cursor.expect(";")?;
            }
            "cgi_path" => {
                if has_cgi_path {
                    bail!("duplicate cgi_path directive in location {}", location.path);
                }
                location.cgi_root = Some(PathBuf::from(cursor.next()?));
                has_cgi_path = true;
                cursor.expect(";")?;
            }
            "cgi_extension" => {
                let ext = cursor.next()?.to_string();
                if !ext.starts_with('.') {
                    bail!("cgi_extension `{}' must start with a dot", ext);
                }
                let interpreter = cursor.next()?.to_string();
                location.cgi_interpreters.insert(ext, interpreter);
                cursor.expect(";")?;
            }
            "location" => bail!("location blocks cannot be nested"),
            other => bail!(
                "unknown directive in location {}: `{}'",
                location.path,
                other
            ),
        }
    }
    Ok(location)
}

fn parse_listen(value: &str) -> Result<(String, u16)> {
    let (host, port) = match value.rfind(':') {
        Some(colon) => (&value[..colon], &value[colon + 1..]),
        None => ("*", value),
    };
    let host = if host == "*" || host.is_empty() {
        "0.0.0.0".to_string()
    } else {
        host.to_string()
    };
    let port = port
        .parse()
        .with_context(|| format!("invalid listen port `{}'", port))?;
    Ok((host, port))
}

fn parse_method(token: &str) -> Result<Method> {
    match token.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::Get),
        "POST" => Ok(Method::Post),
        "PUT" => Ok(Method::Put),
        "DELETE" => Ok(Method::Delete),
        other => bail!("unknown HTTP method `{}'", other),
    }
}

fn parse_on_off(value: &str, directive: &str) -> Result<bool> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        other => bail!("invalid value for {}: `{}' (expected on or off)", directive, other),
    }
}

fn parse_body_size(value: &str) -> Result<usize> {
    let lower = value.to_ascii_lowercase();
    let digits_len = lower.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits_len == 0 {
        bail!("invalid client_max_body_size `{}'", value);
    }
    let number: usize = lower[..digits_len]
        .parse()
        .with_context(|| format!("invalid client_max_body_size `{}'", value))?;
    let multiplier: usize = match &lower[digits_len..] {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        suffix => bail!("invalid size suffix `{}'", suffix),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("client_max_body_size overflows"))
}
