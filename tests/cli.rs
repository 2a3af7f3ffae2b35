use assert_cmd::Command;
use predicates::str::contains;
use std::{
    fs,
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    process::{self, Stdio},
    thread,
    time::{Duration, Instant},
};
use tempfile::TempDir;

fn cmd() -> Command {
    Command::cargo_bin("strip-folio-item-locations").unwrap()
}

fn write_config(dir: &TempDir, contents: &str) -> String {
    let path = dir.path().join("config.ini");
    fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn missing_config_file_exits_1() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nope.ini").to_string_lossy().into_owned();
    cmd()
        .args(["-C", path.as_str()])
        .env_remove("RUST_LOG")
        .write_stdin("B001\n")
        .assert()
        .code(1)
        .stderr(contains("not found"));
}

#[test]
fn missing_section_header_exits_2() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "okapi_url = https://okapi.example.edu\n");
    cmd()
        .args(["--config_file", path.as_str()])
        .write_stdin("B001\n")
        .assert()
        .code(2)
        .stderr(contains("no section header"));
}

#[test]
fn missing_okapi_key_exits_3() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[Okapi]\nokapi_url = https://okapi.example.edu\ntenant_id = diku\n");
    cmd()
        .args(["-C", path.as_str(), "-vv"])
        .env_remove("OKAPI_USERNAME")
        .write_stdin("B001\n")
        .assert()
        .code(3)
        .stderr(contains("username"));
}

#[test]
fn help_lists_options() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("--infile"))
        .stdout(contains("--outfile"))
        .stdout(contains("--config_file"))
        .stdout(contains("--verbose"));
}

const LOGIN: &str = "HTTP/1.1 201 Created\r\nx-okapi-token: tok-123\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const NO_ITEMS: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 29\r\nconnection: close\r\n\r\n{\"totalRecords\":0,\"items\":[]}";

/// Read one HTTP request, headers and body.
fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// An Okapi that accepts any login and has no items.
fn empty_okapi() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            let request = read_request(&mut stream);
            let response = if request.starts_with("POST /authn/login") { LOGIN } else { NO_ITEMS };
            stream.write_all(response.as_bytes()).ok();
        }
    });
    url
}

#[cfg(unix)]
#[test]
fn interrupt_while_waiting_for_input_exits_0() {
    let okapi = empty_okapi();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        &format!("[Okapi]\nokapi_url = {}\ntenant_id = diku\nusername = diku_admin\npassword = admin\n", okapi),
    );
    let mut child = process::Command::new(env!("CARGO_BIN_EXE_strip-folio-item-locations"))
        .args(["-C", path.as_str()])
        .env_remove("OKAPI_URL")
        .env_remove("OKAPI_TENANT_ID")
        .env_remove("OKAPI_USERNAME")
        .env_remove("OKAPI_PASSWORD")
        .env_remove("HTTP_PROXY")
        .env_remove("http_proxy")
        .env_remove("ALL_PROXY")
        .env_remove("all_proxy")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Send one row and keep stdin open
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(b"B001\n").unwrap();
    stdin.flush().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());
    let mut first = String::new();
    stdout.read_line(&mut first).unwrap();
    assert_eq!(first, "B001\t0\tNo item matching barcode B001\n");

    // The binary is now waiting for the next row
    let killed = process::Command::new("kill").args(["-INT", &child.id().to_string()]).status().unwrap();
    assert!(killed.success());
    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().ok();
            panic!("still running after SIGINT");
        }
        thread::sleep(Duration::from_millis(50));
    };
    let mut rest = String::new();
    stdout.read_to_string(&mut rest).unwrap();
    assert_eq!(status.code(), Some(0));
    assert_eq!(rest, "Interrupted\n");
    drop(stdin);
}
