//! DTLS-PSK sessions between the harness transports over loopback.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use lwm2m_harness::assertions::{assert_demo_registers, RegisterExpectation};
use lwm2m_harness::coap::{BlockOption, Code, Message, MessageType, Token};
use lwm2m_harness::crypto::{Psk, PskKey};
use lwm2m_harness::file_server::{FileServer, Resource};
use lwm2m_harness::messages::Lwm2mMessage;
use lwm2m_harness::server::MockServer;
use lwm2m_harness::time::Deadline;
use lwm2m_harness::transport::dtls::DtlsConfig;
use lwm2m_harness::transport::{Transport, TransportConfig};

fn psk(key_hex: &str) -> Psk {
    Psk::new(b"harness-identity", PskKey::from_hex(key_hex).unwrap())
}

fn secure(key_hex: &str) -> TransportConfig {
    TransportConfig::dtls(DtlsConfig::psk(psk(key_hex)))
}

async fn recv_message(transport: &mut Transport) -> Message {
    let (data, _) = transport
        .recv(Deadline::after(Duration::from_secs(3)))
        .await
        .unwrap();
    Message::decode(&data).unwrap()
}

#[tokio::test]
async fn register_over_dtls_psk() {
    let mut server = MockServer::bind("secure", secure("00112233")).await.unwrap();
    assert!(server.uri().starts_with("coaps://127.0.0.1:"));
    let server_addr = server.local_addr();

    let server_task = tokio::spawn(async move {
        let expectation = RegisterExpectation::default().with_endpoint("urn:dev:os:secure");
        assert_demo_registers(&mut server, &expectation, Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        server
    });

    let mut client = Transport::connect_to(secure("00112233"), server_addr).await.unwrap();
    client.handshake(Deadline::after(Duration::from_secs(5))).await.unwrap();
    assert!(client.dtls().is_some_and(|e| e.is_established()));

    let register = Lwm2mMessage::register("urn:dev:os:secure", Some(300), "1.1", &[])
        .with_ids(0x10, Token::new(vec![0xAB]).unwrap());
    client.send(&register.encode()).await.unwrap();

    let created = recv_message(&mut client).await;
    assert_eq!(created.code, Code::CREATED);
    assert_eq!(created.message_id, 0x10);
    assert_eq!(created.location_path(), "/rd/demo");

    let server = server_task.await.unwrap();
    assert!(server.registration().is_registered());
}

#[tokio::test]
async fn handshake_with_wrong_key_times_out() {
    let mut server = MockServer::bind("secure", secure("00112233")).await.unwrap();
    let server_addr = server.local_addr();
    let server_task = tokio::spawn(async move {
        let _ = server.recv(Deadline::after(Duration::from_secs(3))).await;
    });

    let mut client = Transport::connect_to(secure("deadbeef"), server_addr).await.unwrap();
    let err = client
        .handshake(Deadline::after(Duration::from_millis(2500)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, lwm2m_harness::transport::TransportError::Timeout),
        "{err}"
    );
    server_task.await.unwrap();
}

#[tokio::test]
async fn blockwise_download_over_dtls() {
    let data: Vec<u8> = (0..16 * 1024).map(|i| (i % 253) as u8).collect();
    let file_server = FileServer::start(secure("cafe")).await.unwrap();
    file_server.set_resource("/fw", Resource::new(data.clone()));
    assert!(file_server.uri("fw").starts_with("coaps://"));

    let server_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, file_server.port()));
    let mut client = Transport::connect_to(secure("cafe"), server_addr).await.unwrap();
    client.handshake(Deadline::after(Duration::from_secs(5))).await.unwrap();

    let mut downloaded = Vec::new();
    let mut etag = None;
    for seq in 0u32.. {
        let request = Message::new(MessageType::Confirmable, Code::GET, 100 + seq as u16, Token::new(vec![1]).unwrap())
            .with_uri_path("/fw")
            .with_block2(BlockOption::new(seq, false, 1024).unwrap());
        client.send(&request.encode()).await.unwrap();

        let response = recv_message(&mut client).await;
        assert_eq!(response.code, Code::CONTENT);
        let block = response.block2().unwrap().unwrap();
        assert_eq!(block.seq_num, seq);
        assert_eq!(block.size, 1024);
        let tag = response.etag().map(<[u8]>::to_vec);
        assert_eq!(*etag.get_or_insert(tag.clone()), tag);
        downloaded.extend_from_slice(&response.payload);
        if !block.more {
            break;
        }
    }

    assert_eq!(downloaded, data);
    assert_eq!(file_server.requests_served(), 16);
    file_server.stop().await.unwrap();
}
