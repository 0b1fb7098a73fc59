//! Benchmarks for the hot decode and encode paths.

#![allow(clippy::unwrap_used, missing_docs)]

use bytes::BytesMut;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tdswire_protocol::collation::Collation;
use tdswire_protocol::metadata::{Column, ColumnMetadata, TypeInfo};
use tdswire_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType, packetize};
use tdswire_protocol::token::{Done, Row, TokenType};
use tdswire_protocol::types::TypeId;
use tdswire_protocol::{RpcParam, RpcRequest, TdsVersion, TokenStreamParser};
use tdswire_types::SqlValue;

fn bench_packet_header(c: &mut Criterion) {
    let header = PacketHeader::new(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, 4096);
    let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
    header.encode(&mut buf);
    let encoded = buf.freeze();

    c.bench_function("packet_header_decode", |b| {
        b.iter(|| {
            let mut cursor = encoded.clone();
            black_box(PacketHeader::decode(&mut cursor).unwrap())
        })
    });
}

fn bench_packetize(c: &mut Criterion) {
    let payload = vec![0xA5u8; 256 * 1024];
    let mut group = c.benchmark_group("packetize");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("256k_at_4096", |b| {
        b.iter(|| black_box(packetize(PacketType::SqlBatch, &payload, 4096, false)))
    });
    group.finish();
}

fn bench_row_stream(c: &mut Criterion) {
    let md = ColumnMetadata {
        columns: vec![
            Column::new("id", TypeInfo::new(TypeId::IntN, 4)),
            Column::new(
                "name",
                TypeInfo::character(TypeId::NVarChar, 200, Collation::default()),
            ),
            Column::new("amount", TypeInfo::decimal(18, 2)),
        ],
    };
    let mut buf = BytesMut::new();
    md.encode(&mut buf).unwrap();
    for i in 0..1000 {
        Row::encode(
            &md,
            &[
                SqlValue::Int(i),
                SqlValue::String(format!("customer {i}")),
                SqlValue::Numeric(tdswire_types::Numeric::new(i128::from(i) * 101, 2).unwrap()),
            ],
            &mut buf,
        )
        .unwrap();
    }
    Done::default().encode(TokenType::Done, &mut buf);
    let data = buf.freeze();

    let mut group = c.benchmark_group("token_stream");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("1000_rows_4k_chunks", |b| {
        b.iter(|| {
            let mut parser = TokenStreamParser::new(TdsVersion::V7_4);
            let mut count = 0usize;
            for chunk in data.chunks(4088) {
                parser.push(chunk);
                while let Some(token) = parser.next_token().unwrap() {
                    black_box(&token);
                    count += 1;
                }
            }
            count
        })
    });
    group.finish();
}

fn bench_rpc_encode(c: &mut Criterion) {
    let params: Vec<RpcParam> = (0..10)
        .map(|i| RpcParam::infer(format!("@p{i}"), SqlValue::String(format!("value {i}"))))
        .collect();
    let request = RpcRequest::execute_sql("SELECT * FROM t WHERE a = @p0", params);
    c.bench_function("rpc_execute_sql_encode", |b| {
        b.iter(|| black_box(request.encode(0, Collation::default()).unwrap()))
    });
}

criterion_group!(benches, bench_packet_header, bench_packetize, bench_row_stream, bench_rpc_encode);
criterion_main!(benches);
