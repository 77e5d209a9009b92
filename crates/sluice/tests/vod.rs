mod common;

use std::io::{Read, SeekFrom};
use std::sync::Arc;

use common::{body, drain, fixtures, init_tracing};
use sluice_engine::testing::MemoryTransport;
use sluice_engine::{
    Capabilities, ContentKind, Mode, SchemeTransport, SessionConfig, SluiceError, StreamSession,
};

const FRAGMENT_SIZE: usize = 1000;

fn ten_fragment_playlist() -> String {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n");
    for i in 0..10 {
        playlist.push_str(&format!("#EXTINF:2.0,\nfrag{i}.ts\n"));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

fn open_ten_fragments() -> (StreamSession, Vec<u8>) {
    open_ten_fragments_with(|_| {})
}

fn open_ten_fragments_with(configure: impl FnOnce(&MemoryTransport)) -> (StreamSession, Vec<u8>) {
    init_tracing();
    let (transport, clock) = fixtures();
    configure(&transport);
    transport.insert("mem://vod/index.m3u8", ten_fragment_playlist());
    let mut expected = Vec::new();
    for i in 0..10u8 {
        let fragment = body(i, FRAGMENT_SIZE);
        expected.extend_from_slice(&fragment);
        transport.insert(format!("mem://vod/frag{i}.ts"), fragment);
    }
    let session = StreamSession::open_with_clock(
        "mem://vod/index.m3u8",
        transport,
        SessionConfig::default(),
        clock,
    )
    .unwrap();
    (session, expected)
}

#[test]
fn sequential_read_concatenates_fragments() {
    let (mut session, expected) = open_ten_fragments();
    assert_eq!(session.mode(), Mode::Vod);
    assert_eq!(session.fragment_count(), Some(10));
    assert_eq!(session.preview(), &expected[..FRAGMENT_SIZE]);
    assert_eq!(
        session.capabilities(),
        Capabilities::SEEKABLE | Capabilities::TIME_SEEKABLE | Capabilities::PREVIEW
    );
    assert_eq!(session.get_length(), None);

    let data = drain(&mut session);
    assert_eq!(data, expected);
    assert_eq!(session.get_length(), Some(10 * FRAGMENT_SIZE as u64));
    assert_eq!(session.read(&mut [0u8; 16]).unwrap(), 0);
}

#[test]
fn byte_seek_matches_sequential_read() {
    let (mut session, expected) = open_ten_fragments();

    assert_eq!(session.seek(SeekFrom::Start(5500)).unwrap(), 5500);
    let mut buf = [0u8; 100];
    session.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &expected[5500..5600]);
    assert_eq!(session.current_fragment(), 6);
    assert!(session.preview().is_empty());

    // backwards across fragments
    session.seek(SeekFrom::Current(-3000)).unwrap();
    session.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &expected[2600..2700]);

    // back inside the first fragment
    session.seek(SeekFrom::Start(10)).unwrap();
    session.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &expected[10..110]);
}

#[test]
fn time_seek_lands_on_fragment_start() {
    let (mut session, expected) = open_ten_fragments();

    let offset = session.seek_time(SeekFrom::Start(7000)).unwrap();
    assert_eq!(offset, 3000);
    let mut buf = [0u8; 10];
    session.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &expected[3000..3010]);

    let offset = session.seek_time(SeekFrom::Current(4000)).unwrap();
    assert_eq!(offset, 5000);
}

#[test]
fn seeks_without_announced_lengths() {
    let (mut session, expected) = open_ten_fragments_with(|transport| {
        for i in 0..10 {
            transport.hide_length(format!("mem://vod/frag{i}.ts"));
        }
    });
    assert_eq!(session.get_length(), None);

    assert_eq!(session.seek(SeekFrom::Start(5500)).unwrap(), 5500);
    let mut buf = [0u8; 100];
    session.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &expected[5500..5600]);
    assert_eq!(session.current_fragment(), 6);
    assert_eq!(session.index().size(5), Some(1000));

    // fragments 6 and 7 are measured to place fragment 8
    assert_eq!(session.seek_time(SeekFrom::Start(15_000)).unwrap(), 7000);
    session.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &expected[7000..7100]);

    session.seek(SeekFrom::Start(2500)).unwrap();
    let mut rest = Vec::new();
    session.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, &expected[2500..]);
    assert_eq!(session.get_length(), Some(10 * FRAGMENT_SIZE as u64));
}

#[test]
fn failed_read_returns_bytes_already_copied() {
    let (mut session, expected) = open_ten_fragments_with(|transport| {
        transport.cut_after("mem://vod/frag2.ts", 200);
    });

    let mut buf = vec![0u8; expected.len()];
    let n = session.read(&mut buf).unwrap();
    assert_eq!(n, 2200);
    assert_eq!(&buf[..n], &expected[..n]);
    assert!(matches!(
        session.read(&mut buf),
        Err(SluiceError::Transport { .. })
    ));
}

#[test]
fn seek_to_end_of_stream_reads_nothing() {
    let (mut session, expected) = open_ten_fragments();
    let data = drain(&mut session);
    assert_eq!(data.len(), expected.len());

    session.seek(SeekFrom::End(-10)).unwrap();
    let mut tail = Vec::new();
    session.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, &expected[expected.len() - 10..]);

    session.seek(SeekFrom::Start(20_000)).unwrap();
    assert_eq!(session.read(&mut [0u8; 8]).unwrap(), 0);
}

#[test]
fn byte_ranges_share_one_sub_stream() {
    init_tracing();
    let (transport, clock) = fixtures();
    transport.insert(
        "mem://hls/vod.m3u8",
        "#EXTM3U\n\
         #EXT-X-TARGETDURATION:2\n\
         #EXT-X-PLAYLIST-TYPE:VOD\n\
         #EXT-X-MAP:URI=\"main.mp4\",BYTERANGE=\"100@0\"\n\
         #EXTINF:2.0,\n\
         #EXT-X-BYTERANGE:300@100\n\
         main.mp4\n\
         #EXTINF:2.0,\n\
         #EXT-X-BYTERANGE:300\n\
         main.mp4\n\
         #EXT-X-ENDLIST\n",
    );
    let resource = body(9, 700);
    transport.insert("mem://hls/main.mp4", resource.clone());

    let mut session = StreamSession::open_with_clock(
        "mem://hls/vod.m3u8",
        transport.clone(),
        SessionConfig::default(),
        clock,
    )
    .unwrap();
    assert_eq!(session.get_length(), Some(700));
    assert_eq!(session.preview(), &resource[..100]);

    assert_eq!(drain(&mut session), resource);
    assert_eq!(transport.open_count("mem://hls/main.mp4"), 1);

    session.seek(SeekFrom::End(-50)).unwrap();
    let mut tail = Vec::new();
    session.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, &resource[650..]);
}

#[test]
fn master_playlist_leads_to_media_playlist() {
    init_tracing();
    let (transport, clock) = fixtures();
    transport.insert(
        "mem://master/index.m3u8",
        "#EXTM3U\n\
         #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
         low/index.m3u8\n\
         #EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720\n\
         high/index.m3u8\n",
    );
    transport.insert(
        "mem://master/high/index.m3u8",
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg.ts\n#EXT-X-ENDLIST\n",
    );
    transport.insert("mem://master/high/seg.ts", body(3, 64));

    let mut session = StreamSession::open_with_clock(
        "mem://master/index.m3u8",
        transport.clone(),
        SessionConfig::default(),
        clock,
    )
    .unwrap();
    let representation = session.representation().unwrap();
    assert_eq!((representation.width, representation.height), (1280, 720));
    assert_eq!(drain(&mut session), body(3, 64));
    assert_eq!(transport.open_count("mem://master/low/index.m3u8"), 0);
}

#[test]
fn self_referencing_master_stops_at_hop_limit() {
    init_tracing();
    let (transport, clock) = fixtures();
    transport.insert(
        "mem://loop/master.m3u8",
        "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=1280x720\nmaster.m3u8\n",
    );

    let err = StreamSession::open_with_clock(
        "mem://loop/master.m3u8",
        transport.clone(),
        SessionConfig::default(),
        clock,
    )
    .err()
    .unwrap();
    assert!(matches!(err, SluiceError::RedirectLoop { hops: 4, .. }));
    assert_eq!(transport.open_count("mem://loop/master.m3u8"), 5);
}

#[test]
fn missing_side_rendition_is_reported() {
    let (session, _) = open_ten_fragments();
    let err = session.side_session(ContentKind::SUBTITLE).err().unwrap();
    assert!(matches!(err, SluiceError::RepresentationUnavailable { .. }));
}

#[test]
fn closed_session_rejects_io() {
    let (mut session, _) = open_ten_fragments();
    session.close();
    assert!(session.index().is_empty());
    assert!(matches!(session.read(&mut [0u8; 4]), Err(SluiceError::Closed)));
    assert!(matches!(
        session.seek(SeekFrom::Start(0)),
        Err(SluiceError::Closed)
    ));
}

#[test]
fn plays_local_files() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut expected = Vec::new();
    let mut playlist = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:1\n");
    for i in 0..3u8 {
        let fragment = body(i + 40, 256);
        std::fs::write(dir.path().join(format!("part{i}.ts")), &fragment).unwrap();
        expected.extend_from_slice(&fragment);
        playlist.push_str(&format!("#EXTINF:1.0,\npart{i}.ts\n"));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    let index = dir.path().join("index.m3u8");
    std::fs::write(&index, playlist).unwrap();

    let transport = Arc::new(SchemeTransport::new().unwrap());
    let mut session = StreamSession::open(
        index.to_str().unwrap(),
        transport,
        SessionConfig::default().with_preview_size(100),
    )
    .unwrap();
    assert_eq!(session.preview().len(), 100);
    assert_eq!(drain(&mut session), expected);
}
