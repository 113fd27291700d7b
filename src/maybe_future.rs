use std::{
    future::{Future, IntoFuture},
    pin::Pin,
    task::{ready, Context, Poll},
};

/// An operation that may be waited on synchronously or asynchronously.
///
/// A `MaybeFuture` can be run asynchronously with `.await`, or
/// run synchronously (blocking the current thread) with `.wait()`.
#[must_use = "`MaybeFuture` does nothing unless you call `.wait()` or `.await`"]
pub trait MaybeFuture: IntoFuture<IntoFuture: Send> + Send {
    /// Block waiting for the operation to complete
    fn wait(self) -> Self::Output;

    /// Apply a function to the output.
    fn map<T: FnOnce(Self::Output) -> R + Unpin + Send, R>(self, f: T) -> Map<Self, T>
    where
        Self: Sized,
    {
        Map {
            wrapped: self,
            func: f,
        }
    }
}

pub(crate) mod blocking {
    use super::MaybeFuture;
    use std::{
        future::{Future, IntoFuture},
        pin::Pin,
        task::{Context, Poll},
    };

    /// Wrapper that invokes a FnOnce on a background thread when
    /// awaited, or directly when waited on synchronously.
    pub struct Blocking<F> {
        f: F,
    }

    impl<F> Blocking<F> {
        pub fn new(f: F) -> Self {
            Self { f }
        }
    }

    impl<F, R> IntoFuture for Blocking<F>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        type Output = R;

        type IntoFuture = BlockingTask<R>;

        fn into_future(self) -> Self::IntoFuture {
            BlockingTask::spawn(self.f)
        }
    }

    impl<F, R> MaybeFuture for Blocking<F>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        fn wait(self) -> R {
            (self.f)()
        }
    }

    #[cfg(feature = "smol")]
    pub struct BlockingTask<R>(blocking::Task<R, ()>);

    // With both features enabled, `smol` wins because it needs no runtime to be started
    #[cfg(all(feature = "tokio", not(feature = "smol")))]
    pub struct BlockingTask<R>(tokio::task::JoinHandle<R>);

    #[cfg(not(any(feature = "smol", feature = "tokio")))]
    pub struct BlockingTask<R>(std::marker::PhantomData<R>);

    impl<R: Send + 'static> BlockingTask<R> {
        #[cfg(feature = "smol")]
        fn spawn(f: impl FnOnce() -> R + Send + 'static) -> Self {
            Self(blocking::unblock(f))
        }

        #[cfg(all(feature = "tokio", not(feature = "smol")))]
        fn spawn(f: impl FnOnce() -> R + Send + 'static) -> Self {
            Self(tokio::task::spawn_blocking(f))
        }

        #[cfg(not(any(feature = "smol", feature = "tokio")))]
        fn spawn(_f: impl FnOnce() -> R + Send + 'static) -> Self {
            panic!("Awaiting a blocking wait without an async runtime: enable the `smol` or `tokio` feature of usbirp, or call `.wait()`.");
        }
    }

    impl<R> Unpin for BlockingTask<R> {}

    impl<R> Future for BlockingTask<R> {
        type Output = R;

        #[cfg(feature = "smol")]
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            Pin::new(&mut self.0).poll(cx)
        }

        #[cfg(all(feature = "tokio", not(feature = "smol")))]
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            match Pin::new(&mut self.0).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(r)) => Poll::Ready(r),
                Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Pending, // Can happen during runtime shutdown
                Poll::Ready(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Poll::Ready(Err(e)) => panic!("Error from tokio blocking task: {e}"),
            }
        }

        #[cfg(not(any(feature = "smol", feature = "tokio")))]
        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
            unreachable!()
        }
    }
}

/// Adapter returned by [`MaybeFuture::map`].
pub struct Map<F, T> {
    wrapped: F,
    func: T,
}

impl<F, T, R> IntoFuture for Map<F, T>
where
    F: MaybeFuture<IntoFuture: Unpin>,
    T: FnOnce(F::Output) -> R + Unpin,
{
    type Output = R;
    type IntoFuture = MapFut<F::IntoFuture, T>;

    fn into_future(self) -> Self::IntoFuture {
        MapFut {
            wrapped: self.wrapped.into_future(),
            func: Some(self.func),
        }
    }
}

impl<F, T, R> MaybeFuture for Map<F, T>
where
    F: MaybeFuture<IntoFuture: Unpin>,
    T: FnOnce(F::Output) -> R + Unpin + Send,
{
    fn wait(self) -> Self::Output {
        (self.func)(self.wrapped.wait())
    }
}

/// Future returned by awaiting a [`Map`].
pub struct MapFut<F, T> {
    wrapped: F,
    func: Option<T>,
}

impl<F: Future + Unpin, T: FnOnce(F::Output) -> R + Unpin, R> Future for MapFut<F, T> {
    type Output = R;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let output = ready!(Pin::new(&mut self.wrapped).poll(cx));
        let func = self.func.take().expect("MapFut polled after completion");
        Poll::Ready(func(output))
    }
}

#[cfg(test)]
mod tests {
    use super::{blocking::Blocking, MaybeFuture};

    #[test]
    fn wait_runs_inline() {
        let t = std::thread::current().id();
        let r = Blocking::new(move || std::thread::current().id() == t)
            .map(|same| if same { 1 } else { 0 })
            .wait();
        assert_eq!(r, 1);
    }

    #[cfg(feature = "smol")]
    #[test]
    fn await_on_thread_pool() {
        let r = futures_lite::future::block_on(async { Blocking::new(|| 21).map(|x| x * 2).await });
        assert_eq!(r, 42);
    }
}
