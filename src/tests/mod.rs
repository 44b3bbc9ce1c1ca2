mod continuation;
