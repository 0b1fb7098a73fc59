//! Token stream parsing across arbitrary chunk boundaries.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::BytesMut;
use proptest::prelude::*;
use tdswire_protocol::collation::Collation;
use tdswire_protocol::metadata::{Column, ColumnMetadata, TypeInfo};
use tdswire_protocol::token::{
    Done, DoneStatus, EnvChange, EnvChangeType, Row, ServerMessage, Token, TokenType,
};
use tdswire_protocol::types::TypeId;
use tdswire_protocol::value::plp::{write_plp_chunk, write_plp_terminator, write_plp_unknown_header};
use tdswire_protocol::{TdsVersion, TokenStreamParser};
use tdswire_types::SqlValue;

fn metadata() -> ColumnMetadata {
    ColumnMetadata {
        columns: vec![
            Column::new("id", TypeInfo::new(TypeId::IntN, 8)),
            Column::new(
                "name",
                TypeInfo::character(TypeId::NVarChar, 100, Collation::default()),
            ),
            Column::new("blob", TypeInfo::new(TypeId::BigVarBinary, 0xFFFF)),
        ],
    }
}

/// A realistic response: env change, info, a result set with PLP values
/// and a final DONE.
fn response() -> Vec<u8> {
    let md = metadata();
    let mut buf = BytesMut::new();
    EnvChange::encode_string(EnvChangeType::Database, "sales", "master", &mut buf).unwrap();
    ServerMessage {
        number: 5701,
        state: 2,
        class: 0,
        message: "Changed database context to 'sales'.".into(),
        server: "srv".into(),
        procedure: String::new(),
        line: 1,
    }
    .encode(TokenType::Info, &mut buf)
    .unwrap();
    md.encode(&mut buf).unwrap();
    for i in 0..4i64 {
        let blob: Vec<u8> = (0..(i as usize * 700)).map(|b| b as u8).collect();
        Row::encode(
            &md,
            &[
                SqlValue::BigInt(i),
                SqlValue::String(format!("row {i}")),
                SqlValue::Binary(blob.into()),
            ],
            &mut buf,
        )
        .unwrap();
    }
    Done {
        status: DoneStatus::COUNT,
        cur_cmd: 0xC1,
        row_count: 4,
    }
    .encode(TokenType::Done, &mut buf);
    buf.to_vec()
}

fn parse_chunked(data: &[u8], cuts: &[usize]) -> Vec<Token> {
    let mut parser = TokenStreamParser::new(TdsVersion::V7_4);
    let mut tokens = Vec::new();
    let mut start = 0;
    for &cut in cuts.iter().chain(std::iter::once(&data.len())) {
        let cut = cut.clamp(start, data.len());
        parser.push(&data[start..cut]);
        start = cut;
        while let Some(token) = parser.next_token().unwrap() {
            tokens.push(token);
        }
    }
    parser.finish().unwrap();
    tokens
}

#[test]
fn test_every_single_split_point() {
    let data = response();
    let whole = parse_chunked(&data, &[]);
    assert_eq!(whole.len(), 8);
    for split in 0..=data.len() {
        assert_eq!(parse_chunked(&data, &[split]), whole, "split at {split}");
    }
}

#[test]
fn test_unknown_length_plp_in_row() {
    let md = ColumnMetadata {
        columns: vec![Column::new("doc", TypeInfo::new(TypeId::BigVarBinary, 0xFFFF))],
    };
    let mut buf = BytesMut::new();
    md.encode(&mut buf).unwrap();
    buf.extend_from_slice(&[TokenType::Row as u8]);
    write_plp_unknown_header(&mut buf);
    write_plp_chunk(&mut buf, b"hello");
    write_plp_chunk(&mut buf, b"abc");
    write_plp_terminator(&mut buf);

    let tokens = parse_chunked(&buf, &[3, 20, 31]);
    let Token::Row(row) = &tokens[1] else {
        panic!("expected ROW");
    };
    assert_eq!(row.values[0].as_bytes().unwrap(), b"helloabc");
}

proptest! {
    #[test]
    fn prop_chunking_is_invisible(mut cuts in proptest::collection::vec(0usize..6000, 0..12)) {
        let data = response();
        cuts.sort_unstable();
        let expected = parse_chunked(&data, &[]);
        prop_assert_eq!(parse_chunked(&data, &cuts), expected);
    }
}
