//! End-to-end tests against a scripted in-process server.
//!
//! The server side speaks just enough of the backend protocol for each
//! scenario, over a `tokio::io::duplex` pair (or loopback TCP where the
//! code under test opens its own sockets).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use super::connection::{ConnectOptions, PgConnection, SslMode, TlsUpgrade};
use super::protocol::Format;
use super::types::{Oid, PgValue};
use crate::connection::{BoxedSocket, ConnectionEvent, ConnectionState, Holder};
use crate::error::{Error, Result};

/// Backend message builders.
pub(crate) mod backend {
    use super::*;
    use crate::pg::protocol::FieldDescription;

    fn message(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(tag);
        let start = buf.len();
        buf.put_i32(0);
        body(buf);
        let len = (buf.len() - start) as i32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    fn cstring(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    pub(crate) fn column(name: &str, oid: Oid, format: Format) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: oid,
            type_size: -1,
            type_modifier: -1,
            format,
        }
    }

    pub(crate) fn auth_ok(buf: &mut BytesMut) {
        message(buf, b'R', |b| b.put_i32(0));
    }

    pub(crate) fn auth_cleartext(buf: &mut BytesMut) {
        message(buf, b'R', |b| b.put_i32(3));
    }

    pub(crate) fn auth_md5(buf: &mut BytesMut, salt: [u8; 4]) {
        message(buf, b'R', |b| {
            b.put_i32(5);
            b.put_slice(&salt);
        });
    }

    pub(crate) fn auth_sasl(buf: &mut BytesMut, mechanisms: &[&str]) {
        message(buf, b'R', |b| {
            b.put_i32(10);
            for m in mechanisms {
                cstring(b, m);
            }
            b.put_u8(0);
        });
    }

    pub(crate) fn auth_sasl_continue(buf: &mut BytesMut, data: &str) {
        message(buf, b'R', |b| {
            b.put_i32(11);
            b.put_slice(data.as_bytes());
        });
    }

    pub(crate) fn auth_sasl_final(buf: &mut BytesMut, data: &str) {
        message(buf, b'R', |b| {
            b.put_i32(12);
            b.put_slice(data.as_bytes());
        });
    }

    pub(crate) fn parameter_status(buf: &mut BytesMut, name: &str, value: &str) {
        message(buf, b'S', |b| {
            cstring(b, name);
            cstring(b, value);
        });
    }

    pub(crate) fn backend_key(buf: &mut BytesMut, process_id: i32, secret_key: i32) {
        message(buf, b'K', |b| {
            b.put_i32(process_id);
            b.put_i32(secret_key);
        });
    }

    pub(crate) fn ready(buf: &mut BytesMut, status: u8) {
        message(buf, b'Z', |b| b.put_u8(status));
    }

    pub(crate) fn row_description(buf: &mut BytesMut, columns: &[FieldDescription]) {
        message(buf, b'T', |b| {
            b.put_i16(columns.len() as i16);
            for col in columns {
                cstring(b, &col.name);
                b.put_i32(col.table_oid);
                b.put_i16(col.column_attr);
                b.put_i32(col.type_oid.as_i32());
                b.put_i16(col.type_size);
                b.put_i32(col.type_modifier);
                b.put_i16(col.format as i16);
            }
        });
    }

    pub(crate) fn data_row<V: AsRef<[u8]>>(buf: &mut BytesMut, values: &[Option<V>]) {
        message(buf, b'D', |b| {
            b.put_i16(values.len() as i16);
            for value in values {
                match value {
                    Some(v) => {
                        b.put_i32(v.as_ref().len() as i32);
                        b.put_slice(v.as_ref());
                    }
                    None => b.put_i32(-1),
                }
            }
        });
    }

    pub(crate) fn command_complete(buf: &mut BytesMut, tag: &str) {
        message(buf, b'C', |b| cstring(b, tag));
    }

    pub(crate) fn empty_query(buf: &mut BytesMut) {
        message(buf, b'I', |_| {});
    }

    pub(crate) fn parse_complete(buf: &mut BytesMut) {
        message(buf, b'1', |_| {});
    }

    pub(crate) fn bind_complete(buf: &mut BytesMut) {
        message(buf, b'2', |_| {});
    }

    pub(crate) fn close_complete(buf: &mut BytesMut) {
        message(buf, b'3', |_| {});
    }

    pub(crate) fn no_data(buf: &mut BytesMut) {
        message(buf, b'n', |_| {});
    }

    pub(crate) fn portal_suspended(buf: &mut BytesMut) {
        message(buf, b's', |_| {});
    }

    pub(crate) fn parameter_description(buf: &mut BytesMut, oids: &[Oid]) {
        message(buf, b't', |b| {
            b.put_i16(oids.len() as i16);
            for oid in oids {
                b.put_i32(oid.as_i32());
            }
        });
    }

    fn fields(buf: &mut BytesMut, tag: u8, severity: &str, code: &str, text: &str) {
        message(buf, tag, |b| {
            for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', text)] {
                b.put_u8(field);
                cstring(b, value);
            }
            b.put_u8(0);
        });
    }

    pub(crate) fn error_response(buf: &mut BytesMut, code: &str, text: &str) {
        fields(buf, b'E', "ERROR", code, text);
    }

    pub(crate) fn notice(buf: &mut BytesMut, text: &str) {
        fields(buf, b'N', "NOTICE", "00000", text);
    }

    pub(crate) fn notification(buf: &mut BytesMut, process_id: i32, channel: &str, payload: &str) {
        message(buf, b'A', |b| {
            b.put_i32(process_id);
            cstring(b, channel);
            cstring(b, payload);
        });
    }
}

// ============================================================================
// Scripted server
// ============================================================================

const PROCESS_ID: i32 = 4242;
const SECRET_KEY: i32 = 777;

struct MockServer<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MockServer<S> {
    fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Startup-style message without a tag.
    async fn read_untagged(&mut self) -> Bytes {
        let len = self.stream.read_i32().await.unwrap();
        let mut body = vec![0; len as usize - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        Bytes::from(body)
    }

    /// `None` once the client has gone away.
    async fn try_read(&mut self) -> Option<(u8, Bytes)> {
        let tag = self.stream.read_u8().await.ok()?;
        let len = self.stream.read_i32().await.ok()?;
        let mut body = vec![0; len as usize - 4];
        self.stream.read_exact(&mut body).await.ok()?;
        Some((tag, Bytes::from(body)))
    }

    async fn expect(&mut self, tag: u8) -> Bytes {
        let (got, body) = self.try_read().await.expect("client closed the stream");
        assert_eq!(got as char, tag as char, "unexpected frontend message");
        body
    }

    async fn expect_tags(&mut self, tags: &[u8]) {
        for tag in tags {
            self.expect(*tag).await;
        }
    }

    async fn expect_silence(&mut self) {
        let read = tokio::time::timeout(Duration::from_millis(50), self.stream.read_u8()).await;
        assert!(read.is_err(), "client wrote unexpectedly");
    }

    async fn send(&mut self, build: impl FnOnce(&mut BytesMut)) {
        let mut buf = BytesMut::new();
        build(&mut buf);
        self.stream.write_all(&buf).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn finish_startup(&mut self) {
        self.send(|b| {
            backend::auth_ok(b);
            backend::parameter_status(b, "server_version", "16.2");
            backend::parameter_status(b, "client_encoding", "UTF8");
            backend::backend_key(b, PROCESS_ID, SECRET_KEY);
            backend::ready(b, b'I');
        })
        .await;
    }

    /// Accept a startup without authentication; returns the startup body.
    async fn accept_trust(&mut self) -> Bytes {
        let startup = self.read_untagged().await;
        self.finish_startup().await;
        startup
    }

    async fn complete(&mut self, tag: &str) {
        self.send(|b| {
            backend::command_complete(b, tag);
            backend::ready(b, b'I');
        })
        .await;
    }
}

fn text(body: &[u8]) -> &str {
    std::str::from_utf8(body.strip_suffix(&[0]).unwrap_or(body)).unwrap()
}

async fn connect(options: ConnectOptions) -> (PgConnection, MockServer<DuplexStream>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut server = MockServer::new(server);
    let (conn, _) = tokio::join!(
        PgConnection::connect_socket(Box::new(client), options, None),
        server.accept_trust()
    );
    (conn.unwrap(), server)
}

#[derive(Default)]
struct RecordingHolder {
    events: Mutex<Vec<ConnectionEvent>>,
    exceptions: Mutex<Vec<Error>>,
    closed: AtomicUsize,
}

impl Holder for RecordingHolder {
    fn handle_event(&self, event: ConnectionEvent) {
        self.events.lock().push(event);
    }

    fn handle_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_exception(&self, error: &Error) {
        self.exceptions.lock().push(error.clone());
    }
}

// ============================================================================
// Handshake
// ============================================================================

mod handshake {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    #[tokio::test]
    async fn test_startup_parameters_and_session() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server = MockServer::new(server);
        let options = ConnectOptions::new()
            .user("app")
            .database("inventory")
            .param("search_path", "app");

        let (conn, startup) = tokio::join!(
            PgConnection::connect_socket(Box::new(client), options, None),
            server.accept_trust()
        );
        let conn = conn.unwrap();

        assert_eq!(&startup[..4], &196608i32.to_be_bytes());
        let pairs: Vec<&str> = startup[4..]
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| std::str::from_utf8(s).unwrap())
            .collect();
        assert_eq!(&pairs[..4], &["user", "app", "database", "inventory"]);
        assert!(pairs.windows(2).any(|w| w == ["search_path", "app"]));
        assert!(pairs.windows(2).any(|w| w == ["client_encoding", "UTF8"]));

        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.process_id(), PROCESS_ID);
        assert_eq!(conn.parameter("server_version"), Some("16.2"));
    }

    #[tokio::test]
    async fn test_md5_authentication() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server = MockServer::new(server);
        let options = ConnectOptions::new().user("u").password("p");

        let script = async {
            server.read_untagged().await;
            server.send(|b| backend::auth_md5(b, [1, 2, 3, 4])).await;
            let password = server.expect(b'p').await;
            assert_eq!(text(&password), "md5facdc455923b0a58efea84a6d9ee0e76");
            server.finish_startup().await;
        };
        let (conn, _) = tokio::join!(
            PgConnection::connect_socket(Box::new(client), options, None),
            script
        );
        assert!(conn.unwrap().is_open());
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_scram_authentication() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server = MockServer::new(server);
        let options = ConnectOptions::new().user("app").password("s3cret");

        let script = async {
            server.read_untagged().await;
            server.send(|b| backend::auth_sasl(b, &["SCRAM-SHA-256"])).await;

            let initial = server.expect(b'p').await;
            let nul = initial.iter().position(|b| *b == 0).unwrap();
            assert_eq!(&initial[..nul], b"SCRAM-SHA-256");
            let client_first = std::str::from_utf8(&initial[nul + 5..]).unwrap().to_string();
            let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_string();
            let client_nonce = client_first_bare
                .split(',')
                .find_map(|p| p.strip_prefix("r="))
                .unwrap()
                .to_string();

            let salt = b"NaCl-for-tests";
            let server_first = format!(
                "r={}server-part,s={},i=4096",
                client_nonce,
                BASE64.encode(salt)
            );
            server
                .send(|b| backend::auth_sasl_continue(b, &server_first))
                .await;

            let client_final = server.expect(b'p').await;
            let client_final = std::str::from_utf8(&client_final).unwrap();
            let (without_proof, _) = client_final.rsplit_once(",p=").unwrap();
            let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

            let mut salted = [0u8; 32];
            pbkdf2::pbkdf2::<Hmac<Sha256>>(b"s3cret", salt, 4096, &mut salted).unwrap();
            let server_key = hmac(&salted, b"Server Key");
            let signature = hmac(&server_key, auth_message.as_bytes());
            let verifier = format!("v={}", BASE64.encode(signature));
            server.send(|b| backend::auth_sasl_final(b, &verifier)).await;
            server.finish_startup().await;
        };

        let (conn, _) = tokio::join!(
            PgConnection::connect_socket(Box::new(client), options, None),
            script
        );
        assert!(conn.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_rejected_password_fails_connect() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server = MockServer::new(server);
        let options = ConnectOptions::new().user("u").password("wrong");

        let script = async {
            server.read_untagged().await;
            server.send(backend::auth_cleartext).await;
            assert_eq!(text(&server.expect(b'p').await), "wrong");
            server
                .send(|b| backend::error_response(b, "28P01", "password authentication failed"))
                .await;
        };
        let (conn, _) = tokio::join!(
            PgConnection::connect_socket(Box::new(client), options, None),
            script
        );
        assert_eq!(conn.unwrap_err().code(), Some("28P01"));
    }

    #[tokio::test]
    async fn test_password_request_without_password() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server = MockServer::new(server);

        let script = async {
            server.read_untagged().await;
            server.send(backend::auth_cleartext).await;
        };
        let (conn, _) = tokio::join!(
            PgConnection::connect_socket(Box::new(client), ConnectOptions::new(), None),
            script
        );
        assert!(matches!(conn, Err(Error::Auth(_))));
    }
}

// ============================================================================
// TLS
// ============================================================================

mod tls {
    use super::*;
    use async_trait::async_trait;

    const SSL_REQUEST: [u8; 8] = [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f];

    #[derive(Default)]
    struct PassThrough {
        upgraded: AtomicUsize,
    }

    #[async_trait]
    impl TlsUpgrade for PassThrough {
        async fn upgrade(&self, socket: BoxedSocket, host: &str) -> Result<BoxedSocket> {
            assert_eq!(host, "localhost");
            self.upgraded.fetch_add(1, Ordering::SeqCst);
            Ok(socket)
        }
    }

    async fn negotiate(mode: SslMode, answer: u8, tls: &PassThrough) -> Result<PgConnection> {
        let (client, server) = tokio::io::duplex(4096);
        let mut server = MockServer::new(server);
        let options = ConnectOptions::new().ssl_mode(mode);

        let script = async {
            let mut request = [0u8; 8];
            server.stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request, SSL_REQUEST);
            server.send_raw(&[answer]).await;
            if answer == b'S' || mode == SslMode::Prefer {
                server.accept_trust().await;
            }
        };
        let (conn, _) = tokio::join!(
            PgConnection::connect_socket(Box::new(client), options, Some(tls as &dyn TlsUpgrade)),
            script
        );
        conn
    }

    #[tokio::test]
    async fn test_upgrade_when_accepted() {
        let tls = PassThrough::default();
        negotiate(SslMode::Require, b'S', &tls).await.unwrap();
        assert_eq!(tls.upgraded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prefer_falls_back_to_plain() {
        let tls = PassThrough::default();
        negotiate(SslMode::Prefer, b'N', &tls).await.unwrap();
        assert_eq!(tls.upgraded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_require_fails_when_declined() {
        let tls = PassThrough::default();
        let result = negotiate(SslMode::Require, b'N', &tls).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_require_without_upgrader() {
        let (client, _server) = tokio::io::duplex(64);
        let options = ConnectOptions::new().ssl_mode(SslMode::Require);
        let result = PgConnection::connect_socket(Box::new(client), options, None).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

// ============================================================================
// Queries
// ============================================================================

mod queries {
    use super::*;
    use crate::pg::protocol::FieldDescription;

    fn int_and_text() -> Vec<FieldDescription> {
        vec![
            backend::column("n", Oid::INT4, Format::Text),
            backend::column("label", Oid::TEXT, Format::Text),
        ]
    }

    #[tokio::test]
    async fn test_simple_query_text_rows() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        let script = async {
            assert_eq!(text(&server.expect(b'Q').await), "SELECT n, label FROM t");
            server
                .send(|b| {
                    backend::row_description(b, &int_and_text());
                    backend::data_row(b, &[Some(&b"1"[..]), Some(&b"one"[..])]);
                    backend::data_row(b, &[Some(&b"2"[..]), None]);
                    backend::command_complete(b, "SELECT 2");
                    backend::ready(b, b'I');
                })
                .await;
        };
        let (results, _) = tokio::join!(conn.simple_query("SELECT n, label FROM t"), script);
        let results = results.unwrap();

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.rows_affected(), 2);
        assert_eq!(result.rows[0].get(0), Some(&PgValue::Int4(1)));
        assert_eq!(result.rows[0].get_by_name("label"), Some(&PgValue::Text("one".into())));
        assert_eq!(result.rows[1].get_by_name("label"), Some(&PgValue::Null));
    }

    #[tokio::test]
    async fn test_prepare_and_execute_in_binary() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        let script = async {
            let parse = server.expect(b'P').await;
            assert!(parse.starts_with(b"__sw_0\0SELECT"));
            server.expect_tags(b"DS").await;
            server
                .send(|b| {
                    backend::parse_complete(b);
                    backend::parameter_description(b, &[Oid::INT4]);
                    backend::row_description(b, &int_and_text());
                    backend::ready(b, b'I');
                })
                .await;
        };
        let (statement, _) = tokio::join!(
            conn.prepare("SELECT n, label FROM t WHERE n = $1"),
            script
        );
        let statement = statement.unwrap();
        assert_eq!(statement.param_types, vec![Oid::INT4]);
        assert!(statement.returns_rows());

        let script = async {
            let bind = server.expect(b'B').await;
            assert!(bind.starts_with(b"\0__sw_0\0"));
            // one binary parameter holding int4 5
            assert!(bind.windows(8).any(|w| w == [0, 0, 0, 4, 0, 0, 0, 5]));
            server.expect_tags(b"ES").await;
            server
                .send(|b| {
                    backend::bind_complete(b);
                    backend::data_row(b, &[Some(&5i32.to_be_bytes()[..]), Some(&b"five"[..])]);
                    backend::command_complete(b, "SELECT 1");
                    backend::ready(b, b'I');
                })
                .await;
        };
        // Widened from int8 towards the declared int4
        let (result, _) = tokio::join!(conn.execute(&statement, &[PgValue::Int8(5)]), script);
        let row = &result.unwrap().rows[0];
        assert_eq!(row.values(), &[PgValue::Int4(5), PgValue::Text("five".into())]);
    }

    #[tokio::test]
    async fn test_wrong_argument_count_never_reaches_the_wire() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        let script = async {
            server.expect_tags(b"PDS").await;
            server
                .send(|b| {
                    backend::parse_complete(b);
                    backend::parameter_description(b, &[Oid::INT4, Oid::INT4]);
                    backend::no_data(b);
                    backend::ready(b, b'I');
                })
                .await;
        };
        let (statement, _) = tokio::join!(conn.prepare("UPDATE t SET n = $1 WHERE n = $2"), script);
        let statement = statement.unwrap();
        assert!(!statement.returns_rows());

        let result = conn.execute(&statement, &[PgValue::Int4(1)]).await;
        assert!(matches!(result, Err(Error::Type(_))));
        server.expect_silence().await;
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_statement_cache_reuses_and_evicts() {
        let (conn, mut server) = connect(ConnectOptions::new().statement_cache_capacity(1)).await;

        async fn answer_prepare(server: &mut MockServer<DuplexStream>) {
            server.expect_tags(b"PDS").await;
            server
                .send(|b| {
                    backend::parse_complete(b);
                    backend::parameter_description(b, &[]);
                    backend::row_description(b, &[backend::column("x", Oid::INT4, Format::Text)]);
                    backend::ready(b, b'I');
                })
                .await;
        }

        async fn answer_execute(server: &mut MockServer<DuplexStream>, value: i32) {
            server.expect_tags(b"BES").await;
            server
                .send(|b| {
                    backend::bind_complete(b);
                    backend::data_row(b, &[Some(value.to_be_bytes())]);
                    backend::command_complete(b, "SELECT 1");
                    backend::ready(b, b'I');
                })
                .await;
        }

        let script = async {
            answer_prepare(&mut server).await;
            answer_execute(&mut server, 1).await;
        };
        let (first, _) = tokio::join!(conn.query("SELECT 1", &[]), script);
        assert_eq!(first.unwrap().rows[0].get(0), Some(&PgValue::Int4(1)));

        // Cache hit: no Parse
        let (again, _) = tokio::join!(conn.query("SELECT 1", &[]), answer_execute(&mut server, 1));
        assert_eq!(again.unwrap().rows.len(), 1);

        // Capacity 1: preparing a second query closes the first statement
        let script = async {
            answer_prepare(&mut server).await;
            let close = server.expect(b'C').await;
            assert_eq!(&close[..], b"S__sw_0\0");
            server.expect(b'S').await;
            server
                .send(|b| {
                    backend::close_complete(b);
                    backend::ready(b, b'I');
                })
                .await;
            answer_execute(&mut server, 2).await;
        };
        let (second, _) = tokio::join!(conn.query("SELECT 2", &[]), script);
        assert_eq!(second.unwrap().rows[0].get(0), Some(&PgValue::Int4(2)));
        assert_eq!(conn.cached_statements(), 1);
    }

    #[tokio::test]
    async fn test_closed_cached_statement_is_prepared_again() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        async fn answer(server: &mut MockServer<DuplexStream>, value: i32) {
            server.expect_tags(b"PDS").await;
            server
                .send(|b| {
                    backend::parse_complete(b);
                    backend::parameter_description(b, &[]);
                    backend::row_description(b, &[backend::column("x", Oid::INT4, Format::Text)]);
                    backend::ready(b, b'I');
                })
                .await;
            server.expect_tags(b"BES").await;
            server
                .send(|b| {
                    backend::bind_complete(b);
                    backend::data_row(b, &[Some(value.to_be_bytes())]);
                    backend::command_complete(b, "SELECT 1");
                    backend::ready(b, b'I');
                })
                .await;
        }

        let (first, _) = tokio::join!(conn.query("SELECT x", &[]), answer(&mut server, 1));
        assert!(first.is_ok());
        let stale = conn.cached_statement("SELECT x").unwrap();
        stale.mark_closed();

        let (second, _) = tokio::join!(conn.query("SELECT x", &[]), answer(&mut server, 2));
        assert_eq!(second.unwrap().rows[0].get(0), Some(&PgValue::Int4(2)));
        let fresh = conn.cached_statement("SELECT x").unwrap();
        assert!(!fresh.is_closed());
        assert_ne!(fresh.name, stale.name);
        assert_eq!(conn.cached_statements(), 1);
    }

    #[tokio::test]
    async fn test_execute_batch_reports_each_entry() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        let script = async {
            server.expect_tags(b"PDS").await;
            server
                .send(|b| {
                    backend::parse_complete(b);
                    backend::parameter_description(b, &[Oid::INT4]);
                    backend::no_data(b);
                    backend::ready(b, b'I');
                })
                .await;
        };
        let (statement, _) = tokio::join!(conn.prepare("INSERT INTO t VALUES ($1)"), script);
        let statement = statement.unwrap();

        let script = async {
            server.expect_tags(b"BEBEBES").await;
            server
                .send(|b| {
                    for _ in 0..3 {
                        backend::bind_complete(b);
                        backend::command_complete(b, "INSERT 0 1");
                    }
                    backend::ready(b, b'I');
                })
                .await;
        };
        let batch = vec![
            vec![PgValue::Int4(1)],
            vec![PgValue::Int4(2)],
            vec![PgValue::Int4(3)],
        ];
        let (results, _) = tokio::join!(conn.execute_batch(&statement, batch), script);
        let results = results.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.rows_affected() == 1));

        // A failing entry fails the whole batch; the connection stays usable
        let script = async {
            server.expect_tags(b"BEBES").await;
            server
                .send(|b| {
                    backend::bind_complete(b);
                    backend::command_complete(b, "INSERT 0 1");
                    backend::bind_complete(b);
                    backend::error_response(b, "23505", "duplicate key value");
                    backend::ready(b, b'I');
                })
                .await;
        };
        let batch = vec![vec![PgValue::Int4(4)], vec![PgValue::Int4(4)]];
        let (failed, _) = tokio::join!(conn.execute_batch(&statement, batch), script);
        assert_eq!(failed.unwrap_err().code(), Some("23505"));
        assert!(conn.is_open());

        let empty = conn.execute_batch(&statement, vec![]).await;
        assert!(matches!(empty, Err(Error::Misuse(_))));
        server.expect_silence().await;
    }

    #[tokio::test]
    async fn test_close_statement_twice_is_local_misuse() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        let script = async {
            server.expect_tags(b"PDS").await;
            server
                .send(|b| {
                    backend::parse_complete(b);
                    backend::parameter_description(b, &[]);
                    backend::no_data(b);
                    backend::ready(b, b'I');
                })
                .await;
            server.expect_tags(b"CS").await;
            server
                .send(|b| {
                    backend::close_complete(b);
                    backend::ready(b, b'I');
                })
                .await;
        };
        let statement = async {
            let statement = conn.prepare("COMMIT").await.unwrap();
            conn.close_statement(&statement).await.unwrap();
            statement
        };
        let (statement, _) = tokio::join!(statement, script);

        assert!(statement.is_closed());
        assert!(matches!(
            conn.close_statement(&statement).await,
            Err(Error::Misuse(_))
        ));
        assert!(matches!(
            conn.execute(&statement, &[]).await,
            Err(Error::Misuse(_))
        ));
        server.expect_silence().await;
    }
}

// ============================================================================
// Pipelining
// ============================================================================

mod pipelining {
    use super::*;

    #[tokio::test]
    async fn test_limit_one_waits_for_each_response() {
        let (conn, mut server) = connect(ConnectOptions::new().pipelining_limit(1)).await;

        let first = conn.simple_query("SELECT 1");
        let second = conn.simple_query("SELECT 2");
        let third = conn.simple_query("SELECT 3");

        assert_eq!(text(&server.expect(b'Q').await), "SELECT 1");
        server.expect_silence().await;
        let stats = conn.stats().await;
        assert_eq!((stats.in_flight, stats.pending), (1, 2));

        server.complete("SELECT 1").await;
        assert_eq!(text(&server.expect(b'Q').await), "SELECT 2");
        server.complete("SELECT 2").await;
        assert_eq!(text(&server.expect(b'Q').await), "SELECT 3");

        let stats = conn.stats().await;
        assert_eq!((stats.in_flight, stats.pending), (1, 0));
        server.complete("SELECT 3").await;

        let tags: Vec<String> = [first.await, second.await, third.await]
            .into_iter()
            .map(|r| r.unwrap()[0].command_tag.clone())
            .collect();
        assert_eq!(tags, ["SELECT 1", "SELECT 2", "SELECT 3"]);
        assert_eq!(conn.stats().await.in_flight, 0);
    }

    #[tokio::test]
    async fn test_responses_follow_schedule_order() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        let queries: Vec<_> = (0..5).map(|i| conn.simple_query(&format!("SELECT {}", i))).collect();
        for i in 0..5 {
            assert_eq!(text(&server.expect(b'Q').await), format!("SELECT {}", i));
        }
        for i in 0..5 {
            server.complete(&format!("SELECT {}", i)).await;
        }
        for (i, query) in queries.into_iter().enumerate() {
            assert_eq!(query.await.unwrap()[0].command_tag, format!("SELECT {}", i));
        }
    }

    #[tokio::test]
    async fn test_eager_replies_do_not_stall_large_batches() {
        // The server answers each query before reading the next, over a
        // pipe far smaller than what the client has queued
        let (client, server) = tokio::io::duplex(4096);
        let mut server = MockServer::new(server);
        let (conn, _) = tokio::join!(
            PgConnection::connect_socket(Box::new(client), ConnectOptions::new(), None),
            server.accept_trust()
        );
        let conn = conn.unwrap();

        let padding = "x".repeat(1024);
        tokio::spawn(async move {
            while let Some((tag, _)) = server.try_read().await {
                if tag != b'Q' {
                    break;
                }
                server
                    .send(|b| {
                        backend::parameter_status(b, "application_name", &padding);
                        backend::command_complete(b, "SELECT 0");
                        backend::ready(b, b'I');
                    })
                    .await;
            }
        });

        let sql = format!("SELECT '{}'", "y".repeat(2048));
        let queries: Vec<_> = (0..200).map(|_| conn.simple_query(&sql)).collect();
        let results = tokio::time::timeout(
            Duration::from_secs(10),
            futures::future::join_all(queries),
        )
        .await
        .expect("pipelined queries stalled");
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_server_error_fails_only_its_command() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        let bad = conn.simple_query("SELEC 1");
        let good = conn.simple_query("SELECT 1");
        server.expect_tags(b"QQ").await;
        server
            .send(|b| {
                backend::error_response(b, "42601", "syntax error at or near \"SELEC\"");
                backend::ready(b, b'I');
                backend::command_complete(b, "SELECT 1");
                backend::ready(b, b'I');
            })
            .await;

        let err = bad.await.unwrap_err();
        assert_eq!(err.code(), Some("42601"));
        assert_eq!(good.await.unwrap()[0].command_tag, "SELECT 1");
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_close_is_written_after_queued_commands() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        let query = conn.simple_query("SELECT 1");
        let script = async {
            server.expect(b'Q').await;
            server.complete("SELECT 1").await;
            server.expect(b'X').await;
        };
        let (_, result, _) = tokio::join!(conn.close(), query, script);
        assert!(result.is_ok());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.simple_query("SELECT 1").await,
            Err(Error::NotOpen(ConnectionState::Closed))
        ));
    }
}

// ============================================================================
// Cursors
// ============================================================================

mod cursors {
    use super::*;
    use crate::pg::statement::PreparedStatement;

    async fn prepare(
        conn: &PgConnection,
        server: &mut MockServer<DuplexStream>,
    ) -> Arc<PreparedStatement> {
        let script = async {
            server.expect_tags(b"PDS").await;
            server
                .send(|b| {
                    backend::parse_complete(b);
                    backend::parameter_description(b, &[Oid::INT4]);
                    backend::row_description(b, &[backend::column("id", Oid::INT4, Format::Text)]);
                    backend::ready(b, b'I');
                })
                .await;
        };
        let (statement, _) = tokio::join!(conn.prepare("SELECT id FROM t WHERE id > $1"), script);
        statement.unwrap()
    }

    fn rows(b: &mut BytesMut, ids: std::ops::RangeInclusive<i32>) {
        for id in ids {
            backend::data_row(b, &[Some(id.to_be_bytes())]);
        }
    }

    fn max_rows(execute: &[u8]) -> i32 {
        i32::from_be_bytes(execute[execute.len() - 4..].try_into().unwrap())
    }

    #[tokio::test]
    async fn test_read_in_batches_until_exhausted() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;
        let statement = prepare(&conn, &mut server).await;
        let cursor = conn.cursor(&statement, vec![PgValue::Int4(0)]).unwrap();

        assert!(matches!(cursor.has_more(), Err(Error::Misuse(_))));

        let script = async {
            server.expect(b'B').await;
            let execute = server.expect(b'E').await;
            assert_eq!(max_rows(&execute), 2);
            server.expect(b'S').await;
            server
                .send(|b| {
                    backend::bind_complete(b);
                    rows(b, 1..=2);
                    backend::portal_suspended(b);
                    backend::ready(b, b'T');
                })
                .await;
        };
        let (batch, _) = tokio::join!(cursor.read(2), script);
        assert_eq!(batch.unwrap().len(), 2);
        assert!(cursor.has_more().unwrap());

        // Suspended portal: execute only
        let script = async {
            let execute = server.expect(b'E').await;
            assert!(execute.starts_with(cursor.portal().as_bytes()));
            server.expect(b'S').await;
            server
                .send(|b| {
                    rows(b, 3..=3);
                    backend::command_complete(b, "SELECT 1");
                    backend::ready(b, b'T');
                })
                .await;
        };
        let (batch, _) = tokio::join!(cursor.read(2), script);
        let batch = batch.unwrap();
        assert_eq!(batch[0].get(0), Some(&PgValue::Int4(3)));
        assert!(!cursor.has_more().unwrap());

        assert!(matches!(cursor.read(2).await, Err(Error::Misuse(_))));

        let script = async {
            let close = server.expect(b'C').await;
            assert_eq!(close[0], b'P');
            server.expect(b'S').await;
            server
                .send(|b| {
                    backend::close_complete(b);
                    backend::ready(b, b'T');
                })
                .await;
        };
        let (closed, _) = tokio::join!(cursor.close(), script);
        closed.unwrap();

        // Idempotent and local
        cursor.close().await.unwrap();
        assert!(cursor.is_closed());
        server.expect_silence().await;
    }

    #[tokio::test]
    async fn test_unopened_close_is_local() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;
        let statement = prepare(&conn, &mut server).await;
        let cursor = conn.cursor(&statement, vec![PgValue::Int4(0)]).unwrap();

        cursor.close().await.unwrap();
        assert!(matches!(cursor.read(1).await, Err(Error::Misuse(_))));
        server.expect_silence().await;
    }

    #[tokio::test]
    async fn test_row_stream_fetches_on_demand() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;
        let statement = prepare(&conn, &mut server).await;
        let mut stream = conn
            .cursor(&statement, vec![PgValue::Int4(0)])
            .unwrap()
            .into_rows(2);
        let demand = stream.demand();

        let consumer = tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(row) = stream.next().await {
                ids.push(row.unwrap().get(0).cloned());
            }
            ids
        });

        // No demand yet, so nothing is fetched
        server.expect_silence().await;
        demand.request(3);

        server.expect_tags(b"BES").await;
        server
            .send(|b| {
                backend::bind_complete(b);
                rows(b, 1..=2);
                backend::portal_suspended(b);
                backend::ready(b, b'T');
            })
            .await;
        server.expect_tags(b"ES").await;
        server
            .send(|b| {
                rows(b, 3..=3);
                backend::command_complete(b, "SELECT 1");
                backend::ready(b, b'T');
            })
            .await;
        // Exhausted: the portal is released
        server.expect_tags(b"CS").await;
        server
            .send(|b| {
                backend::close_complete(b);
                backend::ready(b, b'T');
            })
            .await;

        let ids = consumer.await.unwrap();
        assert_eq!(
            ids,
            vec![
                Some(PgValue::Int4(1)),
                Some(PgValue::Int4(2)),
                Some(PgValue::Int4(3))
            ]
        );
        assert_eq!(demand.outstanding(), 0);
    }
}

// ============================================================================
// Connection failures and events
// ============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_eof_fails_outstanding_commands_and_notifies_once() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;
        let holder = Arc::new(RecordingHolder::default());
        conn.set_holder(Some(holder.clone()));

        let first = conn.simple_query("SELECT pg_sleep(10)");
        let second = conn.simple_query("SELECT 1");
        server.expect_tags(b"QQ").await;
        drop(server);

        let first = first.await.unwrap_err();
        let second = second.await.unwrap_err();
        assert!(first.is_closed() && second.is_closed());
        assert!(first.close_cause().is_some());

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.simple_query("SELECT 1").await,
            Err(Error::NotOpen(ConnectionState::Closed))
        ));
        assert_eq!(holder.closed.load(Ordering::SeqCst), 1);
        assert_eq!(holder.exceptions.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_length_is_fatal() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;

        let query = conn.simple_query("SELECT 1");
        server.expect(b'Q').await;
        server.send_raw(&[b'C', 0, 0, 0, 2]).await;

        let err = query.await.unwrap_err();
        assert!(matches!(err.close_cause(), Some(Error::Framing(_))));
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (conn, mut server) = connect(ConnectOptions::new().max_frame_length(1024)).await;

        let query = conn.simple_query("SELECT repeat('x', 4096)");
        server.expect(b'Q').await;
        server.send_raw(&[b'D', 0, 0, 0x10, 0]).await;

        let err = query.await.unwrap_err();
        assert!(matches!(err.close_cause(), Some(Error::Framing(_))));
    }

    #[tokio::test]
    async fn test_cancel_request_on_side_channel() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (conn, _server) = connect(ConnectOptions::new().host("127.0.0.1").port(port)).await;

        let accept = async {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            request
        };
        let (sent, request) = tokio::join!(conn.cancel_request(), accept);
        sent.unwrap();

        let mut expected = vec![0, 0, 0, 16, 0x04, 0xd2, 0x16, 0x2e];
        expected.extend_from_slice(&PROCESS_ID.to_be_bytes());
        expected.extend_from_slice(&SECRET_KEY.to_be_bytes());
        assert_eq!(request, expected);
        assert!(conn.is_open());
    }
}

mod events {
    use super::*;

    #[tokio::test]
    async fn test_out_of_band_messages_go_to_holder() {
        let (conn, mut server) = connect(ConnectOptions::new()).await;
        let holder = Arc::new(RecordingHolder::default());
        conn.set_holder(Some(holder.clone()));

        let query = conn.simple_query("LISTEN jobs");
        server.expect(b'Q').await;
        server
            .send(|b| {
                backend::notice(b, "already listening");
                backend::command_complete(b, "LISTEN");
                backend::notification(b, 99, "jobs", "run-42");
                backend::ready(b, b'I');
                backend::parameter_status(b, "TimeZone", "UTC");
            })
            .await;

        assert_eq!(query.await.unwrap()[0].command_tag, "LISTEN");
        // Events after the reply are delivered by the time the next command completes
        let ping = conn.simple_query("SELECT 1");
        server.expect(b'Q').await;
        server.complete("SELECT 1").await;
        ping.await.unwrap();

        let events = holder.events.lock().clone();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ConnectionEvent::Notice(n) if n.message == "already listening"));
        assert_eq!(
            events[1],
            ConnectionEvent::Notification {
                process_id: 99,
                channel: "jobs".to_string(),
                payload: "run-42".to_string(),
            }
        );
        assert_eq!(
            events[2],
            ConnectionEvent::ParameterStatus {
                name: "TimeZone".to_string(),
                value: "UTC".to_string(),
            }
        );
        assert_eq!(holder.closed.load(Ordering::SeqCst), 0);
    }
}

// ============================================================================
// Pool
// ============================================================================

mod pool {
    use super::*;
    use crate::pg::pool::PgPool;
    use crate::pool::{PoolOptions, PoolStrategy};
    use tokio::net::TcpListener;

    /// Accept any number of trust-authenticated sessions; every simple
    /// query is answered with one row holding the session's ordinal.
    async fn serve(listener: TcpListener, sessions: Arc<AtomicUsize>) {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let ordinal = sessions.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(async move {
                let mut server = MockServer::new(socket);
                server.accept_trust().await;
                while let Some((tag, _)) = server.try_read().await {
                    match tag {
                        b'Q' => {
                            let value = ordinal.to_string();
                            server
                                .send(|b| {
                                    backend::row_description(
                                        b,
                                        &[backend::column("session", Oid::INT4, Format::Text)],
                                    );
                                    backend::data_row(b, &[Some(value.as_bytes())]);
                                    backend::command_complete(b, "SELECT 1");
                                    backend::ready(b, b'I');
                                })
                                .await;
                        }
                        b'X' => return,
                        other => panic!("unexpected message {}", other as char),
                    }
                }
            });
        }
    }

    async fn start() -> (ConnectOptions, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sessions = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve(listener, Arc::clone(&sessions)));
        (ConnectOptions::new().host("127.0.0.1").port(port), sessions)
    }

    #[tokio::test]
    async fn test_single_connection_is_handed_to_next_waiter() {
        let (options, sessions) = start().await;
        let pool = PgPool::connect(options, PoolOptions::default().max_size(1)).unwrap();

        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        let second = tokio::spawn(pool.acquire());

        let status = pool.status().await;
        assert_eq!((status.size, status.checked_out, status.waiters), (1, 1, 1));

        drop(first);
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.id(), first_id);

        let rows = second.simple_query("SELECT 1").await.unwrap();
        assert_eq!(rows[0].rows[0].get(0), Some(&PgValue::Int4(1)));
        drop(second);

        pool.close().await;
        assert_eq!(sessions.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn test_shared_strategy_uses_one_session() {
        let (options, sessions) = start().await;
        let pool = PgPool::connect(
            options,
            PoolOptions::default().strategy(PoolStrategy::Shared),
        )
        .unwrap();

        let (a, b, c) = tokio::join!(
            pool.simple_query("SELECT 1"),
            pool.simple_query("SELECT 1"),
            pool.simple_query("SELECT 1")
        );
        for result in [a, b, c] {
            assert_eq!(result.unwrap()[0].rows[0].get(0), Some(&PgValue::Int4(1)));
        }
        assert_eq!(sessions.load(Ordering::SeqCst), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_connect_failure_reaches_the_caller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = ConnectOptions::new().host("127.0.0.1").port(port);
        let pool = PgPool::connect(options, PoolOptions::default()).unwrap();
        assert!(matches!(pool.acquire().await, Err(Error::Io(_))));
        assert_eq!(pool.status().await.size, 0);
    }
}
