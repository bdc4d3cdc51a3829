//! End-to-end tests over the blocking front end: two `SslStream`s running
//! the loopback engine, connected by in-memory pipes, one per thread.

mod support;

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;

use futures::FutureExt;
use milli_sslstream::engine::loopback::{LoopbackConfig, TRAILER_LEN};
use milli_sslstream::error::{AuthFailure, Operation};
use milli_sslstream::record::alert::AlertDescription;
use milli_sslstream::record::RECORD_HEADER_LEN;
use milli_sslstream::{
    CipherSuite, ClientHelloInfo, CredentialCache, Error, Phase, Protocol, ServerOptions,
    StatusCode,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use support::*;

fn auth_error(result: Result<(), Error>) -> milli_sslstream::AuthenticationError {
    match result {
        Err(Error::Authentication(e)) => e,
        other => panic!("expected authentication error, got {other:?}"),
    }
}

// =========================================================================
// Handshake and properties
// =========================================================================

#[test]
fn handshake_then_echo() {
    let (client, server) = connected(LoopbackConfig::default());

    assert_eq!(client.phase(), Phase::Authenticated);
    assert!(client.is_authenticated() && server.is_authenticated());
    assert!(!client.is_server());
    assert!(server.is_server());
    assert_eq!(client.negotiated_protocol(), Some(Protocol::Tls12));
    assert_eq!(server.cipher_suite(), Some(CipherSuite::TLS_AES_128_GCM_SHA256));
    assert_eq!(client.remote_certificate(), Some(server_cert()));
    assert_eq!(server.local_certificate(), Some(server_cert()));
    assert_eq!(server.remote_certificate(), None);
    assert!(!client.is_mutually_authenticated());
    assert_eq!(server.target_host_name().as_deref(), Some("localhost"));
    assert_eq!(client.max_data_size(), 16384);

    client.write(b"hello").unwrap();
    let mut buf = [0u8; 32];
    let n = server.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");

    server.write(b"world").unwrap();
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"world");
}

#[test]
fn extra_round_trips_complete() {
    let config = LoopbackConfig {
        extra_round_trips: 3,
        ..LoopbackConfig::default()
    };
    let (client, server) = connected(config);
    client.write(b"ping").unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(server.read(&mut buf).unwrap(), 4);
}

#[test]
fn tls13_negotiated_when_configured() {
    let config = LoopbackConfig {
        protocol: Protocol::Tls13,
        ..LoopbackConfig::default()
    };
    let (client, server) = connected(config);
    assert_eq!(client.negotiated_protocol(), Some(Protocol::Tls13));
    assert_eq!(server.negotiated_protocol(), Some(Protocol::Tls13));
}

#[test]
fn second_authenticate_is_rejected() {
    let (client, _server) = connected(LoopbackConfig::default());
    assert!(matches!(
        client.authenticate_as_client(client_options()),
        Err(Error::AlreadyAuthenticated)
    ));
    assert!(client.is_authenticated());
}

#[test]
fn io_before_authentication_fails() {
    let (client, _server) = pair(&LoopbackConfig::default());
    let mut buf = [0u8; 4];
    assert!(matches!(client.read(&mut buf), Err(Error::NotAuthenticated)));
    assert!(matches!(client.write(b"x"), Err(Error::NotAuthenticated)));
    assert!(matches!(client.shutdown(), Err(Error::NotAuthenticated)));
    assert_eq!(client.phase(), Phase::Unauthenticated);
}

// =========================================================================
// Data transfer
// =========================================================================

#[test]
fn large_transfer_in_small_records() {
    let config = LoopbackConfig {
        max_message_size: RECORD_HEADER_LEN + 100 + TRAILER_LEN,
        seed: 42,
        ..LoopbackConfig::default()
    };
    let (client, server) = connected(config);
    assert_eq!(client.max_data_size(), 100);

    let mut data = vec![0u8; 100_000];
    StdRng::seed_from_u64(7).fill_bytes(&mut data);

    let expected = data.clone();
    let writer = thread::spawn(move || {
        client.write(&data).unwrap();
        client.shutdown().unwrap();
        client
    });

    let mut received = Vec::new();
    let mut buf = [0u8; 777];
    loop {
        let n = server.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received.len(), expected.len());
    assert!(received == expected);
    writer.join().unwrap();
}

#[test]
fn records_reassemble_from_single_byte_reads() {
    let config = LoopbackConfig {
        extra_round_trips: 2,
        ..LoopbackConfig::default()
    };
    let ((cr, cw), (sr, sw)) = duplex();
    let client = pipe_stream(cr.trickle(), cw, &config);
    let server = pipe_stream(sr.trickle(), sw, &config);
    let (client, cres, server, sres) = handshake(client, server, client_options(), server_options());
    cres.unwrap();
    sres.unwrap();

    let mut data = vec![0u8; 40_000];
    StdRng::seed_from_u64(3).fill_bytes(&mut data);
    client.write(&data).unwrap();
    client.shutdown().unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = server.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    assert!(received == data);

    server.write(b"reply").unwrap();
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"reply");
}

#[test]
fn empty_read_and_write() {
    let (client, server) = connected(LoopbackConfig::default());
    client.write(&[]).unwrap();
    client.write(b"x").unwrap();
    assert_eq!(server.read(&mut []).unwrap(), 0);
    let mut buf = [0u8; 4];
    assert_eq!(server.read(&mut buf).unwrap(), 1);
}

#[test]
fn close_notify_reads_as_eof() {
    let (client, server) = connected(LoopbackConfig::default());
    client.write(b"last words").unwrap();
    client.shutdown().unwrap();
    assert_eq!(client.phase(), Phase::ShutDown);
    assert!(matches!(client.write(b"more"), Err(Error::WriteAfterShutdown)));
    assert!(matches!(client.shutdown(), Err(Error::WriteAfterShutdown)));

    let mut buf = [0u8; 64];
    let n = server.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"last words");
    assert_eq!(server.read(&mut buf).unwrap(), 0);
    assert_eq!(server.read(&mut buf).unwrap(), 0);

    // the other direction stays open
    server.write(b"bye").unwrap();
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"bye");
}

#[test]
fn transport_eof_at_record_boundary_reads_as_eof() {
    let (client, server) = connected(LoopbackConfig::default());
    client.write(b"abc").unwrap();
    drop(client);
    let mut buf = [0u8; 8];
    assert_eq!(server.read(&mut buf).unwrap(), 3);
    assert_eq!(server.read(&mut buf).unwrap(), 0);
    assert!(server.is_authenticated());
}

#[test]
fn truncated_record_faults_the_stream() {
    let config = LoopbackConfig::default();
    let ((cr, cw), (sr, sw)) = duplex();
    let raw = cw.injector();
    let client = pipe_stream(cr, cw, &config);
    let server = pipe_stream(sr, sw, &config);
    let (client, cres, server, sres) = handshake(client, server, client_options(), server_options());
    cres.unwrap();
    sres.unwrap();

    raw.push(&[23, 3, 3, 0, 50, 1, 2, 3]);
    raw.close();
    let mut buf = [0u8; 64];
    assert!(matches!(
        server.read(&mut buf),
        Err(Error::UnexpectedEof { op: Operation::Read })
    ));
    assert_eq!(server.phase(), Phase::Faulted);
    assert!(!server.is_authenticated());
    assert!(matches!(server.write(b"x"), Err(Error::UnexpectedEof { .. })));
    drop(client);
}

#[test]
fn invalid_record_header_is_a_framing_error() {
    let config = LoopbackConfig::default();
    let ((cr, cw), (sr, sw)) = duplex();
    let raw = cw.injector();
    let (client, cres, server, sres) = handshake(
        pipe_stream(cr, cw, &config),
        pipe_stream(sr, sw, &config),
        client_options(),
        server_options(),
    );
    cres.unwrap();
    sres.unwrap();

    raw.push(&[99, 3, 3, 0, 1, 0]);
    let mut buf = [0u8; 8];
    assert!(matches!(server.read(&mut buf), Err(Error::Framing(_))));
    drop(client);
}

// =========================================================================
// Disposal
// =========================================================================

#[test]
fn disposed_stream_rejects_everything() {
    let (client, server) = connected(LoopbackConfig::default());
    client.dispose();
    client.dispose();
    let mut buf = [0u8; 4];
    assert!(matches!(client.read(&mut buf), Err(Error::Disposed)));
    assert!(matches!(client.write(b"x"), Err(Error::Disposed)));
    assert!(matches!(client.shutdown(), Err(Error::Disposed)));
    assert!(matches!(client.renegotiate(), Err(Error::Disposed)));
    assert!(matches!(
        client.authenticate_as_client(client_options()),
        Err(Error::Disposed)
    ));
    assert!(!client.is_authenticated());
    drop(server);
}

// =========================================================================
// Handshake failures
// =========================================================================

#[test]
fn unknown_handshake_gets_protocol_version_alert() {
    let config = LoopbackConfig::default();
    let ((mut peer_in, mut peer_out), (sr, sw)) = duplex();
    let server = pipe_stream(sr, sw, &config);

    peer_out.write_all(&[22, 3, 3, 0, 4, 99, 0, 0, 0]).unwrap();
    let e = auth_error(server.authenticate_as_server(server_options()));
    assert_eq!(e.kind, AuthFailure::Engine);
    assert_eq!(server.phase(), Phase::Faulted);

    let mut alert = [0u8; 7];
    peer_in.read_exact(&mut alert).unwrap();
    assert_eq!(alert, [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x46]);
}

#[test]
fn garbage_first_record_is_rejected() {
    let config = LoopbackConfig::default();
    let ((_peer_in, mut peer_out), (sr, sw)) = duplex();
    let server = pipe_stream(sr, sw, &config);
    peer_out.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    assert!(matches!(
        server.authenticate_as_server(server_options()),
        Err(Error::Framing(_))
    ));
}

#[test]
fn peer_hangs_up_mid_handshake() {
    let config = LoopbackConfig::default();
    let ((_peer_in, peer_out), (sr, sw)) = duplex();
    let server = pipe_stream(sr, sw, &config);
    drop(peer_out);
    assert!(matches!(
        server.authenticate_as_server(server_options()),
        Err(Error::UnexpectedEof { op: Operation::Authenticate })
    ));
}

#[test]
fn alpn_mismatch_reports_received_alert() {
    let (client, server) = pair(&LoopbackConfig::default());
    let mut copts = client_options();
    copts.application_protocols = vec![b"h2".to_vec()];
    let mut sopts = server_options();
    sopts.application_protocols = vec![b"imap".to_vec()];

    let (_client, cres, _server, sres) = handshake(client, server, copts, sopts);
    let ce = auth_error(cres);
    assert_eq!(ce.kind, AuthFailure::AlertReceived);
    assert_eq!(ce.alert, Some(AlertDescription::NoApplicationProtocol));
    let se = auth_error(sres);
    assert_eq!(se.kind, AuthFailure::Engine);
    assert_eq!(se.status.map(|s| s.code), Some(StatusCode::ApplicationProtocolMismatch));
}

#[test]
fn alpn_agreement_is_visible() {
    let (client, server) = pair(&LoopbackConfig::default());
    let mut copts = client_options();
    copts.application_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let mut sopts = server_options();
    sopts.application_protocols = vec![b"http/1.1".to_vec(), b"h2".to_vec()];

    let (client, cres, server, sres) = handshake(client, server, copts, sopts);
    cres.unwrap();
    sres.unwrap();
    assert_eq!(server.negotiated_application_protocol().as_deref(), Some(&b"http/1.1"[..]));
    assert_eq!(client.negotiated_application_protocol().as_deref(), Some(&b"http/1.1"[..]));
}

#[test]
fn untrusted_server_certificate_is_rejected() {
    let (client, server) = pair(&LoopbackConfig::default());
    let copts = milli_sslstream::ClientOptions::new("localhost");
    let (client, cres, server, sres) = handshake(client, server, copts, server_options());

    let e = auth_error(cres);
    assert_eq!(e.kind, AuthFailure::CertificateRejected);
    assert_eq!(e.alert, Some(AlertDescription::UnknownCa));
    assert_eq!(client.phase(), Phase::Faulted);

    // the server finished first and then sees our fatal alert
    sres.unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(server.read(&mut buf), Err(Error::Decrypt(_))));
}

#[test]
fn host_name_mismatch_is_rejected() {
    let (client, server) = pair(&LoopbackConfig::default());
    let mut copts = milli_sslstream::ClientOptions::new("elsewhere.example");
    copts.trust_anchors.push(server_cert());
    let (_client, cres, _server, _) = handshake(client, server, copts, server_options());
    let e = auth_error(cres);
    assert_eq!(e.alert, Some(AlertDescription::BadCertificate));
}

fn accept_untrusted(
    cert: Option<&milli_sslstream::Certificate>,
    _: &milli_sslstream::ChainReport,
    policy: milli_sslstream::PolicyErrors,
) -> bool {
    cert.is_some() && policy == milli_sslstream::PolicyErrors::CHAIN_ERRORS
}

#[test]
fn validation_callback_overrides_policy() {
    let (client, server) = pair(&LoopbackConfig::default());
    let mut copts = milli_sslstream::ClientOptions::new("localhost");
    copts.validation = Some(Arc::new(accept_untrusted));
    let (_client, cres, _server, sres) = handshake(client, server, copts, server_options());
    cres.unwrap();
    sres.unwrap();
}

// =========================================================================
// Client certificates
// =========================================================================

fn mutual_options() -> (milli_sslstream::ClientOptions, ServerOptions) {
    let mut copts = client_options();
    copts.client_certificates.push(client_cert());
    let mut sopts = server_options();
    sopts.trust_anchors.push(client_cert());
    (copts, sopts)
}

#[test]
fn required_client_certificate_is_sent() {
    let (client, server) = pair(&LoopbackConfig::default());
    let (copts, mut sopts) = mutual_options();
    sopts.client_certificate_required = true;

    let (client, cres, server, sres) = handshake(client, server, copts, sopts);
    cres.unwrap();
    sres.unwrap();
    assert_eq!(server.remote_certificate(), Some(client_cert()));
    assert_eq!(client.local_certificate(), Some(client_cert()));
    assert!(server.is_mutually_authenticated());
    assert!(client.is_mutually_authenticated());
}

#[test]
fn missing_client_certificate_is_rejected_by_server() {
    let (client, server) = pair(&LoopbackConfig::default());
    let mut sopts = server_options();
    sopts.client_certificate_required = true;

    let (client, cres, _server, sres) = handshake(client, server, client_options(), sopts);
    let e = auth_error(sres);
    assert_eq!(e.kind, AuthFailure::CertificateRejected);
    assert_eq!(e.alert, Some(AlertDescription::CertificateUnknown));

    // the client completed before the server's verdict arrived
    cres.unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(client.read(&mut buf), Err(Error::Decrypt(_))));
}

// =========================================================================
// Renegotiation
// =========================================================================

#[test]
fn server_renegotiation_collects_client_certificate() {
    let (client, server) = pair(&LoopbackConfig::default());
    let (copts, sopts) = mutual_options();
    let (client, cres, server, sres) = handshake(client, server, copts, sopts);
    cres.unwrap();
    sres.unwrap();
    assert_eq!(server.remote_certificate(), None);

    let reader = thread::spawn(move || {
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        (client, buf[..n].to_vec())
    });

    server.renegotiate().unwrap();
    assert_eq!(server.remote_certificate(), Some(client_cert()));
    assert_eq!(server.phase(), Phase::Authenticated);
    // a second round is allowed and keeps the certificate
    server.renegotiate().unwrap();
    server.write(b"after").unwrap();

    let (client, got) = reader.join().unwrap();
    assert_eq!(got, b"after");
    assert_eq!(client.local_certificate(), Some(client_cert()));
    assert!(client.is_mutually_authenticated());

    client.write(b"ack").unwrap();
    let mut buf = [0u8; 8];
    let n = server.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ack");
}

#[test]
fn client_refuses_renegotiation_when_disallowed() {
    let (client, server) = pair(&LoopbackConfig::default());
    let (mut copts, sopts) = mutual_options();
    copts.allow_renegotiation = false;
    let (client, cres, server, sres) = handshake(client, server, copts, sopts);
    cres.unwrap();
    sres.unwrap();

    let renegotiating = thread::spawn(move || server.renegotiate());
    let mut buf = [0u8; 8];
    assert!(matches!(client.read(&mut buf), Err(Error::RenegotiationNotAllowed)));
    assert_eq!(client.phase(), Phase::Faulted);
    drop(client);
    assert!(matches!(
        renegotiating.join().unwrap(),
        Err(Error::UnexpectedEof { .. })
    ));
}

#[test]
fn renegotiation_with_unread_data_fails() {
    let (client, server) = connected(LoopbackConfig::default());
    client.write(b"abcdef").unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(server.read(&mut buf).unwrap(), 2);
    assert!(matches!(server.renegotiate(), Err(Error::RenegotiateWithUnreadData)));
    assert!(server.is_authenticated());
}

#[test]
fn tls13_renegotiation_is_a_no_op() {
    let config = LoopbackConfig {
        protocol: Protocol::Tls13,
        ..LoopbackConfig::default()
    };
    let (_client, server) = connected(config);
    server.renegotiate().unwrap();
    assert!(server.is_authenticated());
}

#[test]
fn client_initiated_renegotiation_is_unsupported() {
    let (client, _server) = connected(LoopbackConfig::default());
    assert!(matches!(client.renegotiate(), Err(Error::RenegotiationUnsupported)));
    assert!(client.is_authenticated());
}

// =========================================================================
// Server option selection and shared credentials
// =========================================================================

#[test]
fn options_selector_sees_client_hello() {
    let (client, server) = pair(&LoopbackConfig::default());
    let server_thread = thread::spawn(move || {
        let selector: milli_sslstream::config::ServerOptionsSelector =
            Arc::new(|hello: ClientHelloInfo| {
                async move {
                    assert_eq!(hello.server_name.as_deref(), Some("localhost"));
                    assert!(hello.supported_versions.allows(Protocol::Tls12));
                    Ok::<_, Error>(ServerOptions::new(server_cert()))
                }
                .boxed()
            });
        let result = server.authenticate_as_server_with_selector(selector);
        (server, result)
    });
    client.authenticate_as_client(client_options()).unwrap();
    let (server, result) = server_thread.join().unwrap();
    result.unwrap();
    assert_eq!(server.target_host_name().as_deref(), Some("localhost"));
    assert_eq!(server.local_certificate(), Some(server_cert()));
}

#[test]
fn failing_selector_aborts_server_handshake() {
    let (client, server) = pair(&LoopbackConfig::default());
    let server_thread = thread::spawn(move || {
        let selector: milli_sslstream::config::ServerOptionsSelector =
            Arc::new(|_: ClientHelloInfo| async { Err::<ServerOptions, _>(Error::InvalidState) }.boxed());
        // dropping the stream closes the pipe under the waiting client
        server.authenticate_as_server_with_selector(selector)
    });
    assert!(matches!(
        client.authenticate_as_client(client_options()),
        Err(Error::UnexpectedEof { op: Operation::Authenticate })
    ));
    assert!(matches!(server_thread.join().unwrap(), Err(Error::InvalidState)));
}

#[test]
fn servers_share_cached_credential() {
    let cache = Arc::new(CredentialCache::default());
    for _ in 0..2 {
        let (client, server) = pair(&LoopbackConfig::default());
        let server = server.credential_cache(cache.clone());
        let (_c, cres, _s, sres) = handshake(client, server, client_options(), server_options());
        cres.unwrap();
        sres.unwrap();
    }
    assert_eq!(cache.len(), 1);
}
