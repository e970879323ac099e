use super::Codec;
use serde::{Deserialize, Serialize};

/// MessagePack codec, field names are kept so that peers may add optional fields.
#[derive(Default, Clone, Copy, Debug)]
pub struct MsgpCodec();

impl Codec for MsgpCodec {
    #[inline]
    fn encode<T: Serialize>(&self, task: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::to_vec_named(task) {
            Ok(buf) => Ok(buf),
            Err(e) => {
                warn!("msgpack encode error: {:?}", e);
                Err(())
            }
        }
    }

    #[inline]
    fn encode_into<T: Serialize>(&self, task: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        if let Err(e) = rmp_serde::encode::write_named(buf, task) {
            warn!("msgpack encode error: {:?}", e);
            return Err(());
        }
        Ok(buf.len() - pre_len)
    }

    #[inline]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::from_slice::<T>(buf) {
            Ok(r) => Ok(r),
            Err(e) => {
                warn!("msgpack decode error: {:?}", e);
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Endpoint {
        host: String,
        port: u16,
    }

    #[test]
    fn test_encode_into_appends() {
        let codec = MsgpCodec::default();
        let mut buf = vec![0xff];
        let ep = Endpoint { host: "10.0.0.1".to_string(), port: 9000 };
        let size = codec.encode_into(&ep, &mut buf).expect("encode");
        assert_eq!(buf.len(), size + 1);
        let decoded: Endpoint = codec.decode(&buf[1..]).expect("decode");
        assert_eq!(decoded, ep);
    }

    #[test]
    fn test_decode_garbage() {
        let codec = MsgpCodec::default();
        assert!(codec.decode::<Endpoint>(&[0xc1, 0x00, 0x01]).is_err());
    }
}
