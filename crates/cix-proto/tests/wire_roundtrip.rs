use proptest::prelude::*;

use cix_proto::{
    decode_announcements, decode_message, encode_announcement, encode_message, JobAnnouncement,
    Message, QueryFlags, QueryKind, QueryMessage,
};

fn arb_query_kind() -> impl Strategy<Value = QueryKind> {
    prop_oneof![
        Just(QueryKind::Sources),
        Just(QueryKind::FollowLocation),
        Just(QueryKind::ReferencesName),
        Just(QueryKind::ListSymbols),
        Just(QueryKind::Status),
        Just(QueryKind::Reindex),
        Just(QueryKind::Shutdown),
    ]
}

proptest! {
    #[test]
    fn query_messages_round_trip(
        kind in arb_query_kind(),
        query in ".{0,64}",
        silent in any::<bool>(),
        build_index in 0u32..4,
    ) {
        let message = Message::Query(QueryMessage {
            kind,
            query,
            flags: QueryFlags { silent, ..QueryFlags::default() },
            build_index,
            projects: vec!["/tmp/project".into()],
        });
        let payload = encode_message(&message).unwrap();
        prop_assert_eq!(decode_message(&payload).unwrap(), message);
    }

    #[test]
    fn announcements_round_trip(jobs in any::<u16>(), tcp_port in any::<u16>()) {
        let record = JobAnnouncement { jobs, tcp_port };
        let decoded = decode_announcements(&encode_announcement(record)).unwrap();
        prop_assert_eq!(decoded, vec![record]);
    }
}
