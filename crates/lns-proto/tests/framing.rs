use lns_core::{DevEui, StationEui};
use lns_proto::transport::{decode_framed_message, encode_frame};
use lns_proto::{
    BusFrame, CloudToDeviceMessage, ProtoError, RemoteCall, RemoteCallKind, RemoteTarget,
    StationMessage, MAX_MESSAGE_BYTES,
};

fn framed_hello() -> Vec<u8> {
    let payload = StationMessage::Hello {
        station: StationEui::new(0xB827_EBFF_FE61_0001),
    }
    .encode()
    .unwrap();
    encode_frame(&payload).unwrap()
}

#[test]
fn decode_framed_message_rejects_truncated_payload() {
    let frame = framed_hello();
    let truncated = &frame[..frame.len() - 1];
    assert!(matches!(
        decode_framed_message::<StationMessage>(truncated),
        Err(ProtoError::Truncated { .. })
    ));
}

#[test]
fn decode_framed_message_rejects_trailing_bytes() {
    let mut frame = framed_hello();
    frame.push(0);
    assert!(matches!(
        decode_framed_message::<StationMessage>(&frame),
        Err(ProtoError::TrailingBytes(1))
    ));
}

#[test]
fn decode_framed_message_rejects_oversized_len_prefix() {
    let oversized_len: u32 = (MAX_MESSAGE_BYTES as u32).saturating_add(1);
    let bytes = oversized_len.to_le_bytes();
    assert!(matches!(
        decode_framed_message::<StationMessage>(&bytes),
        Err(ProtoError::TooLarge { .. })
    ));
}

#[test]
fn remote_call_keeps_kind_target_and_payload_bytes() {
    let message = CloudToDeviceMessage {
        message_id: "c2d-1".into(),
        fport: Some(10),
        confirmed: false,
        payload: (0u8..=255).collect(),
    };
    let inner = message.encode().unwrap();
    let call = RemoteCall::cloud_to_device(DevEui::new(0x0004_A30B_001C_0530), inner.clone());

    let decoded = RemoteCall::decode(&call.encode().unwrap()).unwrap();
    assert_eq!(decoded.kind, RemoteCallKind::CloudToDeviceMessage);
    assert_eq!(
        decoded.target,
        RemoteTarget::Device(DevEui::new(0x0004_A30B_001C_0530))
    );
    assert_eq!(decoded.payload, inner);

    let back = CloudToDeviceMessage::decode(&decoded.payload).unwrap();
    assert_eq!(back, message);
}

#[test]
fn bus_frame_reports_its_topic() {
    let frame = BusFrame::Publish {
        topic: "lns.remote-calls".into(),
        payload: vec![1],
    };
    let decoded = BusFrame::decode(&frame.encode().unwrap()).unwrap();
    assert_eq!(decoded.topic(), "lns.remote-calls");
}

#[cfg(feature = "tokio")]
#[tokio::test]
async fn async_framing_reports_clean_eof_as_closed() {
    let (mut client, mut server) = tokio::io::duplex(64);
    lns_proto::transport::write_frame(&mut client, b"abc")
        .await
        .unwrap();
    drop(client);

    let first = lns_proto::transport::read_frame(&mut server).await.unwrap();
    assert_eq!(first, b"abc");
    assert!(matches!(
        lns_proto::transport::read_frame(&mut server).await,
        Err(ProtoError::ConnectionClosed)
    ));
}
