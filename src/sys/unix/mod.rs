mod epoll;
mod eventfd;
mod timerfd;

pub(crate) use self::epoll::Selector;
pub(crate) use self::eventfd::Awakener;
pub(crate) use self::timerfd::TimerFd;
