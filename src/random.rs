//! Reading random data from the token.

use std::io;

use crate::{
    context::Context,
    pkcs11::{Cryptoki, Provider},
};

/// Reads random bytes generated by the token. Every read is one C_GenerateRandom call.
#[derive(Clone, Debug)]
pub struct TokenRandom<P: Provider = Cryptoki> {
    context: Context<P>,
}

impl<P: Provider> TokenRandom<P> {
    pub(crate) fn new(context: Context<P>) -> Self {
        TokenRandom { context }
    }
}

impl<P: Provider> io::Read for TokenRandom<P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let random = self.context.generate_random(buf.len()).map_err(io::Error::other)?;
        buf.copy_from_slice(&random[..buf.len()]);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use crate::test::{MockProvider, mock_context};

    #[test]
    fn read_exact_from_token() {
        let mock = MockProvider::default();
        let context = mock_context(mock, 2);

        let mut buf = [0u8; 64];
        context.random().read_exact(&mut buf).unwrap();
        assert!(buf.iter().any(|b| *b != 0));
    }

    #[test]
    fn short_token_output_is_an_error() {
        let mock = MockProvider::default();
        let context = mock_context(mock.clone(), 2);
        mock.set_short_random(true);

        let mut buf = [0u8; 64];
        let err = context.random().read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
    }
}
