//! Prometheus remote-write protobuf messages (`prometheus.WriteRequest`),
//! declared by hand with prost derives.

use prost::Message;

use crate::metric;

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

impl From<metric::TimeSeries> for TimeSeries {
    fn from(ts: metric::TimeSeries) -> Self {
        Self {
            labels: ts
                .labels
                .into_vec()
                .into_iter()
                .map(|l| Label {
                    name: l.name,
                    value: l.value,
                })
                .collect(),
            samples: ts
                .samples
                .into_iter()
                .map(|s| Sample {
                    value: s.value,
                    timestamp: s.timestamp_ms,
                })
                .collect(),
        }
    }
}

/// Serializes series into a snappy-compressed `WriteRequest` body.
pub fn encode_write_request(series: Vec<metric::TimeSeries>) -> anyhow::Result<Vec<u8>> {
    let request = WriteRequest {
        timeseries: series.into_iter().map(TimeSeries::from).collect(),
    };
    let raw = request.encode_to_vec();
    let compressed = snap::raw::Encoder::new().compress_vec(&raw)?;
    Ok(compressed)
}

/// Inverse of [`encode_write_request`].
pub fn decode_write_request(body: &[u8]) -> anyhow::Result<WriteRequest> {
    let raw = snap::raw::Decoder::new().decompress_vec(body)?;
    Ok(WriteRequest::decode(raw.as_slice())?)
}
