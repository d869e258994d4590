mod util;

use std::io::Write;

use util::{Response, Server};

const BASIC_CONFIG: &str = "
server {
    listen 127.0.0.1:{port};
    root {root};
    index index.html;
    location / {
        methods GET POST PUT DELETE ;
    }
}
";

#[test]
fn get_static_file() {
    let server = Server::with_config(BASIC_CONFIG);
    server.create_file("index.html", b"hello\n");

    let response = server.request(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    assert_eq!(response.header("Content-Length"), Some("6"));
    assert_eq!(response.body_string(), "hello\n");
    assert!(response.header("Date").is_some());
    assert!(response.header("Server").unwrap().starts_with("palehttpd/"));
}

#[test]
fn directory_serves_index_file() {
    let server = Server::with_config(BASIC_CONFIG);
    server.create_file("index.html", b"front page");

    let response = server.request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_string(), "front page");
}

#[test]
fn keep_alive_serves_two_requests_on_one_connection() {
    let server = Server::with_config(BASIC_CONFIG);
    server.create_file("index.html", b"again");

    let mut stream = server.stream();
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let first = Response::from_reader(&mut stream).unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.header("Connection"), Some("keep-alive"));

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let second = Response::from_reader(&mut stream).unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.body_string(), "again");
}

#[test]
fn pipelined_requests_are_both_served() {
    let server = Server::with_config(BASIC_CONFIG);
    server.create_file("index.html", b"pipelined");

    let mut stream = server.stream();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();
    let first = Response::from_reader(&mut stream).unwrap();
    let second = Response::from_reader(&mut stream).unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(second.status(), 200);
}

#[test]
fn traversal_is_blocked_with_403() {
    let server = Server::with_config(BASIC_CONFIG);
    let response = server.request(b"GET /../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 403);
}

#[test]
fn missing_file_is_404_with_custom_error_page() {
    let server = Server::with_config(
        "
        server {
            listen 127.0.0.1:{port};
            root {root};
            error_page 404 /custom_404.html;
            location / {
                methods GET ;
            }
        }
        ",
    );
    server.create_file("custom_404.html", b"<h1>custom missing page</h1>");

    let response = server.request(b"GET /nope.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 404);
    assert!(response.body_string().contains("custom missing page"));
}

#[test]
fn missing_file_without_error_page_gets_generated_body() {
    let server = Server::with_config(BASIC_CONFIG);
    let response = server.request(b"GET /nope.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 404);
    assert!(response.body_string().contains("Not Found"));
}

#[test]
fn autoindex_lists_directory() {
    let server = Server::with_config(
        "
        server {
            listen 127.0.0.1:{port};
            root {root};
            autoindex on;
            location / {
                methods GET ;
            }
        }
        ",
    );
    server.create_file("alpha.txt", b"a");
    server.create_file("beta.txt", b"b");

    let response = server.request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 200);
    let body = response.body_string();
    assert!(body.contains("alpha.txt"));
    assert!(body.contains("beta.txt"));
}

#[test]
fn configured_redirect_is_returned() {
    let server = Server::with_config(
        "
        server {
            listen 127.0.0.1:{port};
            root {root};
            location / {
                methods GET ;
            }
            location /old {
                return 301 http://example.com/new;
            }
        }
        ",
    );
    let response = server.request(b"GET /old/page HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 301);
    assert_eq!(response.header("Location"), Some("http://example.com/new"));
}

#[test]
fn unknown_method_is_405() {
    let server = Server::with_config(BASIC_CONFIG);
    let response = server.request(b"PATCH / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 405);
}

#[test]
fn method_not_in_location_list_is_405() {
    let server = Server::with_config(
        "
        server {
            listen 127.0.0.1:{port};
            root {root};
            location / {
                methods GET ;
            }
        }
        ",
    );
    let response = server.request(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(response.status(), 405);
}

#[test]
fn http_10_is_refused_with_505() {
    let server = Server::with_config(BASIC_CONFIG);
    let raw = server.request_to_eof(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 505"));
    assert!(text.contains("Connection: close"));
}

#[test]
fn overlong_uri_is_414_and_closes() {
    let server = Server::with_config(BASIC_CONFIG);
    let request = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "a".repeat(2048));
    let raw = server.request_to_eof(request.as_bytes());
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 414"));
    assert!(text.contains("Connection: close"));
}

#[test]
fn oversized_body_is_413() {
    let server = Server::with_config(
        "
        server {
            listen 127.0.0.1:{port};
            root {root};
            client_max_body_size 10;
            location / {
                methods GET POST ;
            }
        }
        ",
    );
    let raw = server.request_to_eof(
        b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world",
    );
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 413"));
}

const CGI_CONFIG: &str = "
server {
    listen 127.0.0.1:{port};
    root {root};
    location / {
        methods GET ;
    }
    location /cgi-bin {
        methods GET POST ;
        cgi_path {root}/cgi-bin;
        cgi_extension .sh /bin/sh;
    }
}
";

const ECHO_SCRIPT: &str = "#!/bin/sh
printf 'Content-Type: text/plain\\r\\n'
printf 'X-Seen-Length: %s\\r\\n' \"$CONTENT_LENGTH\"
printf 'X-Query: %s\\r\\n' \"$QUERY_STRING\"
printf '\\r\\n'
cat
";

#[test]
fn cgi_gets_query_string_and_echoes() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_dir("cgi-bin");
    server.create_script("cgi-bin/echo.sh", ECHO_SCRIPT);

    let response = server.request(b"GET /cgi-bin/echo.sh?a=1&b=2 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.header("X-Query"), Some("a=1&b=2"));
}

#[test]
fn chunked_post_reaches_cgi_as_fixed_length() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_dir("cgi-bin");
    server.create_script("cgi-bin/echo.sh", ECHO_SCRIPT);

    let response = server.request(
        b"POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    );
    assert_eq!(response.status(), 200);
    // The script observes a de-chunked body with a concrete length.
    assert_eq!(response.header("X-Seen-Length"), Some("5"));
    assert_eq!(response.body_string(), "hello");
}

#[test]
fn cgi_status_header_sets_response_code() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_dir("cgi-bin");
    server.create_script(
        "cgi-bin/teapot.sh",
        "#!/bin/sh\nprintf 'Status: 404 Not Found\\r\\n\\r\\ngone'\n",
    );

    let response = server.request(b"GET /cgi-bin/teapot.sh HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 404);
    assert_eq!(response.body_string(), "gone");
}

#[test]
fn broken_cgi_output_is_502() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_dir("cgi-bin");
    server.create_script("cgi-bin/broken.sh", "#!/bin/sh\nprintf 'no separator here'\n");

    let response = server.request(b"GET /cgi-bin/broken.sh HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 502);
}

#[test]
fn expect_continue_handshake() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_dir("cgi-bin");
    server.create_script("cgi-bin/echo.sh", ECHO_SCRIPT);

    let mut stream = server.stream();
    stream
        .write_all(
            b"POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\n",
        )
        .unwrap();

    let interim = Response::from_reader(&mut stream).unwrap();
    assert_eq!(interim.status(), 100);

    stream.write_all(b"abc").unwrap();
    let response = Response::from_reader(&mut stream).unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_string(), "abc");
}

#[test]
fn multipart_upload_stores_file() {
    let server = Server::with_config(
        "
        server {
            listen 127.0.0.1:{port};
            root {root};
            location / {
                methods GET ;
            }
            location /uploads {
                methods POST ;
                upload_path incoming;
                upload_enable on;
            }
        }
        ",
    );
    server.create_dir("incoming");

    let body = "--XBOUND\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"note.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        uploaded contents\r\n\
        --XBOUND--\r\n";
    let request = format!(
        "POST /uploads HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=XBOUND\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );

    let response = server.request(request.as_bytes());
    assert_eq!(response.status(), 201);
    let stored = std::fs::read(server.root().join("incoming/note.txt")).unwrap();
    assert_eq!(stored, b"uploaded contents");
}

#[test]
fn delete_removes_file() {
    let server = Server::with_config(BASIC_CONFIG);
    let victim = server.create_file("victim.txt", b"doomed");

    let response = server.request(b"DELETE /victim.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 204);
    assert!(!victim.exists());
}

#[test]
fn delete_missing_file_is_404() {
    let server = Server::with_config(BASIC_CONFIG);
    let response = server.request(b"DELETE /ghost.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status(), 404);
}

#[test]
fn two_virtual_servers_listen_independently() {
    let server = Server::with_config(
        "
        server {
            listen 127.0.0.1:{port};
            root {root}/site_a;
            index index.html;
            location / {
                methods GET ;
            }
        }
        server {
            listen 127.0.0.1:{port2};
            root {root}/site_b;
            index index.html;
            location / {
                methods GET ;
            }
        }
        ",
    );
    server.create_dir("site_a");
    server.create_dir("site_b");
    server.create_file("site_a/index.html", b"site a");
    server.create_file("site_b/index.html", b"site b");

    let mut first = server.stream();
    first.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
    let response = Response::from_reader(&mut first).unwrap();
    assert_eq!(response.body_string(), "site a");

    let mut second = server.second_stream();
    second.write_all(b"GET / HTTP/1.1\r\nHost: b\r\n\r\n").unwrap();
    let response = Response::from_reader(&mut second).unwrap();
    assert_eq!(response.body_string(), "site b");
}

#[test]
fn sigterm_exits_cleanly() {
    let server = Server::with_config(BASIC_CONFIG);
    let code = server.signal_and_wait(nix::sys::signal::Signal::SIGTERM);
    assert_eq!(code, 0);
}
