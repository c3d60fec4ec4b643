use bytes::BytesMut;
use opald::core::errors::CmsError;
use opald::core::protocol::frame::{CmsFrameCodec, Frame, HDR_LEN};
use opald::core::protocol::ReqCode;
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn test_roundtrip_all_codes() {
    let mut codec = CmsFrameCodec;
    for code in [
        ReqCode::Login,
        ReqCode::Ping,
        ReqCode::Have,
        ReqCode::Select,
        ReqCode::StatFs,
        ReqCode::PrepAdd,
        ReqCode::Redirect,
        ReqCode::Data,
    ] {
        let frame = Frame::new(code, 513, 3, bytes::Bytes::from_static(b"payload"));
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HDR_LEN + 7);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }
}

#[test]
fn test_decode_across_split_reads() {
    let mut codec = CmsFrameCodec;
    let frame = Frame::new(ReqCode::Gone, 9, 0, bytes::Bytes::from_static(b"\x00\x04/a/x"));
    let wire = frame.encode_to_vec();

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&wire[..4]);
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&wire[4..8]);
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&wire[8..]);
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
}

#[test]
fn test_two_frames_in_one_buffer() {
    let mut codec = CmsFrameCodec;
    let f1 = Frame::bare(ReqCode::Ping, 1, 0);
    let f2 = Frame::bare(ReqCode::Pong, 2, 0);
    let mut buf = BytesMut::new();
    codec.encode(f1.clone(), &mut buf).unwrap();
    codec.encode(f2.clone(), &mut buf).unwrap();
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), f1);
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), f2);
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_unknown_code_rejected() {
    let mut codec = CmsFrameCodec;
    let mut buf = BytesMut::from(&[0u8, 7, 0xAB, 0, 0, 0][..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(CmsError::BadRequest(_))
    ));
}

#[test]
fn test_wait_frame_layout() {
    let frame = Frame::wait(11, 30);
    assert_eq!(frame.code, ReqCode::Wait);
    assert_eq!(frame.streamid, 11);
    assert_eq!(frame.data.as_ref(), &30u32.to_be_bytes());
}

#[test]
fn test_error_frame_layout() {
    let frame = Frame::error(4, libc::ENOENT as u32, "No servers have the file");
    assert_eq!(frame.code, ReqCode::Error);
    let errno = u32::from_be_bytes(frame.data[0..4].try_into().unwrap());
    assert_eq!(errno, libc::ENOENT as u32);
    assert_eq!(&frame.data[4..frame.data.len() - 1], b"No servers have the file");
    // Error text is NUL-terminated on the wire.
    assert_eq!(frame.data[frame.data.len() - 1], 0);
}

#[test]
fn test_redirect_frame_layout() {
    let frame = Frame::redirect(8, 1094, "alpha.example.org");
    assert_eq!(frame.code, ReqCode::Redirect);
    let port = u32::from_be_bytes(frame.data[0..4].try_into().unwrap());
    assert_eq!(port, 1094);
    assert_eq!(&frame.data[4..], b"alpha.example.org");
}
