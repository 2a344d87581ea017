//! Property tests for the codecs, reply routing and download reassembly.

mod common;

use common::{Loopback, pattern};
use fxp::protocol::*;
use fxp::{Attrs, Download, Error, MemFs, Packet, Result, SftpSession, TransferConfig, Transport};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Field {
    U8(u8),
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
}

fn arb_field() -> impl Strategy<Value = Field> {
    prop_oneof![
        any::<u8>().prop_map(Field::U8),
        any::<u32>().prop_map(Field::U32),
        any::<u64>().prop_map(Field::U64),
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(Field::Bytes),
    ]
}

fn encode(fields: &[Field]) -> Vec<u8> {
    let mut pkt = Packet::new(SSH_FXP_DATA);
    for field in fields {
        match field {
            Field::U8(v) => pkt.put_u8(*v),
            Field::U32(v) => pkt.put_u32(*v),
            Field::U64(v) => pkt.put_u64(*v),
            Field::Bytes(v) => pkt.put_string(v),
        }
    }
    pkt.into_bytes()
}

/// Read `fields` back out of `pkt`, checking each value.
fn decode(pkt: &Packet, fields: &[Field]) -> Result<()> {
    for field in fields {
        match field {
            Field::U8(v) => assert_eq!(pkt.get_u8()?, *v),
            Field::U32(v) => assert_eq!(pkt.get_u32()?, *v),
            Field::U64(v) => assert_eq!(pkt.get_u64()?, *v),
            Field::Bytes(v) => assert_eq!(pkt.get_string()?, &v[..]),
        }
    }
    Ok(())
}

fn arb_attrs() -> impl Strategy<Value = Attrs> {
    (
        proptest::option::of(any::<u64>()),
        proptest::option::of((any::<u32>(), any::<u32>())),
        proptest::option::of(any::<u32>()),
        proptest::option::of((any::<u32>(), any::<u32>())),
    )
        .prop_map(|(size, owner, permissions, times)| Attrs {
            size,
            owner,
            permissions,
            times,
        })
}

proptest! {
    /// Fields come back out in the order and with the values they went in.
    #[test]
    fn codec_round_trip(fields in proptest::collection::vec(arb_field(), 0..16)) {
        let wire = encode(&fields);
        let pkt = Packet::from_wire(&wire).unwrap();
        prop_assert_eq!(pkt.kind(), SSH_FXP_DATA);
        prop_assert!(decode(&pkt, &fields).is_ok());
        prop_assert_eq!(pkt.remaining(), 0);
    }

    /// Cutting the body anywhere short makes decoding fail instead of overrunning.
    #[test]
    fn truncated_packet_fails(
        fields in proptest::collection::vec(arb_field(), 1..16),
        cut in any::<prop::sample::Index>(),
    ) {
        let wire = encode(&fields);
        // Keep the type byte, drop at least one payload byte.
        let payload = wire.len() - 5;
        prop_assume!(payload > 0);
        let keep = cut.index(payload);
        let mut pkt = Packet::recv_prepare(1 + keep as u32);
        pkt.body_mut().copy_from_slice(&wire[4..5 + keep]);
        pkt.recv_finish().unwrap();
        prop_assert!(matches!(decode(&pkt, &fields), Err(Error::Malformed(_))));
    }

    /// Exactly the flagged attribute fields survive a round trip.
    #[test]
    fn attrs_round_trip(attrs in arb_attrs()) {
        let mut pkt = Packet::new(SSH_FXP_ATTRS);
        pkt.put_attrs(&attrs);
        let rx = Packet::from_wire(&pkt.into_bytes()).unwrap();
        let flags = rx.peek_u32().unwrap();
        prop_assert_eq!(flags, attrs.flags());
        prop_assert_eq!(rx.get_attrs().unwrap(), attrs);
        prop_assert_eq!(rx.remaining(), 0);
    }

    /// Replies delivered in any order reach their own request once; anything else is rejected.
    #[test]
    fn replies_route_exactly_once(
        order in (1usize..12).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()),
    ) {
        let mut sess = SftpSession::new(Box::new(Sink));
        let mut ids = Vec::new();
        for idx in 0..order.len() {
            let mut req = sess.stat_send("/x").unwrap();
            req.set_userdata(idx);
            ids.push(req.id());
            sess.register(req);
        }
        for &idx in &order {
            let pkt = status_reply(ids[idx]);
            let mut req = sess.find_request(&pkt).unwrap().unwrap();
            prop_assert_eq!(req.take_userdata::<usize>(), Some(idx));
        }
        prop_assert_eq!(sess.outstanding(), 0);
        for &id in &ids {
            prop_assert!(sess.find_request(&status_reply(id)).is_err());
        }
    }

    /// Delivered download bytes match the file whatever the reply order.
    #[test]
    fn download_reassembles_any_order(
        size in 0usize..400,
        chunk in 1u32..48,
        window in 1usize..7,
        seed in any::<u64>(),
    ) {
        let mut fs = MemFs::new();
        fs.insert_file("/f", &pattern(size));
        let link = Loopback::new(fs);
        let mut sess = SftpSession::new(Box::new(link.clone()));
        sess.init().unwrap();
        let handle = sess.open("/f", SSH_FXF_READ, &Attrs::NONE).unwrap();

        let cfg = TransferConfig::default().with_chunk_size(chunk).with_max_requests(window);
        let mut rng = seed | 1;
        link.hold();
        let mut dl = Download::init(&mut sess, handle, 0, cfg).unwrap();
        let mut out = Vec::new();
        loop {
            shuffle_held(&link, &mut rng);
            link.release_in_order();
            while let Some(pkt) = sess.recv_packet().unwrap() {
                dl.gotpkt(&mut sess, pkt).unwrap();
            }
            while let Some(data) = dl.data().unwrap() {
                out.extend_from_slice(&data);
            }
            if dl.done() {
                break;
            }
            link.hold();
            dl.queue(&mut sess).unwrap();
        }
        prop_assert_eq!(out, pattern(size));
    }
}

fn shuffle_held(link: &Loopback, rng: &mut u64) {
    let mut state = link.0.borrow_mut();
    let held = &mut state.held;
    for idx in (1..held.len()).rev() {
        *rng ^= *rng << 13;
        *rng ^= *rng >> 7;
        *rng ^= *rng << 17;
        held.swap(idx, (*rng % (idx as u64 + 1)) as usize);
    }
}

fn status_reply(id: u32) -> Packet {
    let mut pkt = Packet::new(SSH_FXP_STATUS);
    pkt.put_u32(id);
    pkt.put_u32(SSH_FX_OK);
    Packet::from_wire(&pkt.into_bytes()).unwrap()
}

/// Transport that swallows requests and never answers.
struct Sink;

impl Transport for Sink {
    fn send(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn recv(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }
}

#[test]
fn framer_handles_arbitrary_splits() {
    let wire: Vec<u8> = (0..5u32)
        .flat_map(|id| {
            let mut pkt = Packet::new(SSH_FXP_HANDLE);
            pkt.put_u32(id);
            pkt.put_string(&pattern(id as usize * 3));
            pkt.into_bytes()
        })
        .collect();
    let mut framer = fxp::Framer::new(1024);
    let mut seen = Vec::new();
    for piece in wire.chunks(3) {
        framer.push(piece).unwrap();
        while let Some(pkt) = framer.next_packet() {
            seen.push(pkt.get_u32().unwrap());
        }
    }
    assert_eq!(seen, [0, 1, 2, 3, 4]);
    assert!(framer.is_idle());
}
