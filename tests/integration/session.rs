use std::time::Duration;

use tokio::net::TcpListener;

use ghostline::{RemoteSession, SessionError, Target};
use ghostline_core::wire;

use crate::*;

#[tokio::test]
async fn negotiate_is_one_enveloped_request() {
    let mut peer = FakePeer::spawn(|_, _| Some(echo())).await.unwrap();

    let mut session = RemoteSession::connect(&peer.target()).await.unwrap();
    let response = session.negotiate().await.unwrap();
    session.close().await;

    assert!(wire::is_protocol_echo(&response));

    let conns = peer.connections(1).await.unwrap();
    assert_eq!(conns[0].len(), 1);
    assert_eq!(conns[0][0], wire::negotiate_request().to_vec());
}

#[tokio::test]
async fn refused_connect_names_the_target() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let target = Target {
        host: "127.0.0.1".to_string(),
        port,
        timeout: Duration::from_millis(300),
        response_len: 1000,
    };

    match RemoteSession::connect(&target).await {
        Err(SessionError::Connect(addr, _)) => assert_eq!(addr, format!("127.0.0.1:{port}")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connected to a closed port"),
    }
}
